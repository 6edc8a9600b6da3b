use opendal::Operator;

pub type RawStorage = Operator;

/// Memory-backed operator, shared by the object-store emulator and tests.
pub fn new_mem_operator(root: &str) -> RawStorage {
    let mut builder = opendal::services::Memory::default();
    builder.root(root);
    Operator::new(builder).unwrap().finish()
}

/// Filesystem-backed operator rooted at a fresh temp dir.
pub fn new_temp_fs_operator() -> Result<RawStorage, opendal::Error> {
    let temp = tempfile::Builder::new()
        .prefix("tsumiki")
        .tempdir()
        .expect("create temp dir");
    new_fs_operator(temp.into_path().to_str().unwrap())
}

pub fn new_fs_operator(path: &str) -> Result<RawStorage, opendal::Error> {
    let temp_dir = format!("{}-temp", path);
    let mut builder = opendal::services::Fs::default();
    builder.root(path);
    builder.atomic_write_dir(&temp_dir);
    let op = Operator::new(builder)?.finish();
    Ok(op)
}
