use std::sync::Arc;

use bytes::Bytes;

use tsumiki_store::mem::MemStore;
use tsumiki_store::{CommitOptions, ObjectStore};
use tsumiki_types::block_id::BlockId;
use tsumiki_types::ToErrno;
use tsumiki_vfs::{Config, TsumikiFs};

const MIB: usize = 1 << 20;

fn newfs(store: Arc<MemStore>, config: Config) -> TsumikiFs {
    TsumikiFs::new(store, config)
}

/// Commit `content` to the store as fixed-size blocks, bypassing the fs,
/// the way another client would have written it.
async fn seed_chunked(store: &MemStore, path: &str, content: &[u8], chunk: usize) {
    let mut ids = Vec::new();
    for part in content.chunks(chunk) {
        let id = BlockId::mint(16).unwrap();
        store
            .stage_block(path, &id, Bytes::copy_from_slice(part))
            .await
            .unwrap();
        ids.push(id);
    }
    store
        .commit_block_list(path, &ids, &CommitOptions::default())
        .await
        .unwrap();
}

fn patterned(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

async fn read_all(fs: &TsumikiFs, fh: u64, size: usize) -> Vec<u8> {
    let mut buf = vec![0u8; size];
    let n = fs.read(fh, 0, &mut buf).await.unwrap();
    assert_eq!(n, size);
    buf
}

#[tokio::test]
async fn small_file_overwrite() {
    let store = Arc::new(MemStore::new());
    let fs = newfs(store.clone(), Config::default());

    let fh = fs.create("f").await.unwrap();
    fs.write(fh, 0, b"test data").await.unwrap();
    fs.flush(fh).await.unwrap();

    let props = store.get_properties("f").await.unwrap();
    assert_eq!(props.size, 9);
    assert!(props.block_list.is_none(), "small files carry no block list");
    let bytes = store.download_range("f", 0..9).await.unwrap();
    assert_eq!(bytes.as_ref(), b"test data");
}

#[tokio::test]
async fn partial_block_overwrite() {
    let store = Arc::new(MemStore::new());
    let content = b"testdatates1dat1tes2dat2tes3dat3tes4dat4";
    seed_chunked(&store, "f", content, 4).await;

    let fs = newfs(store.clone(), Config::default());
    let fh = fs.open("f").await.unwrap();
    fs.write(fh, 16, b"cake").await.unwrap();
    fs.flush(fh).await.unwrap();

    let bytes = store.download_range("f", 0..40).await.unwrap();
    assert_eq!(bytes.as_ref(), b"testdatates1dat1cakedat2tes3dat3tes4dat4");
    // untouched blocks kept their identities: still ten of them
    let props = store.get_properties("f").await.unwrap();
    assert_eq!(props.block_list.unwrap().len(), 10);
}

#[tokio::test]
async fn append_past_eof_leaves_zeros_in_the_gap() {
    let store = Arc::new(MemStore::new());
    let fs = newfs(store.clone(), Config::default());

    let fh = fs.create("f").await.unwrap();
    fs.write(fh, 0, &[7u8; 40]).await.unwrap();
    fs.flush(fh).await.unwrap();

    fs.write(fh, 45, b"43211234cake").await.unwrap();
    fs.flush(fh).await.unwrap();

    let props = store.get_properties("f").await.unwrap();
    assert_eq!(props.size, 57);
    let bytes = store.download_range("f", 0..57).await.unwrap();
    assert_eq!(&bytes[..40], &[7u8; 40]);
    assert_eq!(&bytes[40..45], &[0u8; 5]);
    assert_eq!(&bytes[45..], b"43211234cake");
}

#[tokio::test]
async fn far_write_builds_holes_in_block_mode() {
    tsumiki_utils::logger::install_fmt_log();
    let store = Arc::new(MemStore::new());
    let fs = newfs(
        store.clone(),
        Config {
            block_size_mb: 1,
            ..Default::default()
        },
    );

    let fh = fs.create("f").await.unwrap();
    fs.write(fh, 0, &[9u8; 100]).await.unwrap();
    // far past the end: forces promotion out of small-file mode and fills
    // the gap with zero blocks
    let tail = patterned(64, 1);
    fs.write(fh, (2 * MIB + MIB / 2) as u64, &tail).await.unwrap();
    fs.flush(fh).await.unwrap();

    let size = 2 * MIB + MIB / 2 + 64;
    let props = store.get_properties("f").await.unwrap();
    assert_eq!(props.size, size as u64);
    assert!(props.block_list.is_some());

    // read back across the hole through the handle
    let mut buf = vec![1u8; 4096];
    let n = fs.read(fh, MIB as u64, &mut buf).await.unwrap();
    assert_eq!(n, 4096);
    assert_eq!(buf, vec![0u8; 4096]);

    let head = store.download_range("f", 0..100).await.unwrap();
    assert_eq!(head.as_ref(), &[9u8; 100]);
    let gap = store
        .download_range("f", 100..(MIB as u64))
        .await
        .unwrap();
    assert!(gap.iter().all(|&b| b == 0));
    let written = store
        .download_range("f", (2 * MIB + MIB / 2) as u64..size as u64)
        .await
        .unwrap();
    assert_eq!(written.as_ref(), &tail[..]);
}

#[tokio::test]
async fn append_blocks_to_chunked_file() {
    let store = Arc::new(MemStore::new());
    let base = patterned(16 * MIB, 3);
    seed_chunked(&store, "f", &base, 4 * MIB).await;

    let fs = newfs(
        store.clone(),
        Config {
            block_size_mb: 4,
            ..Default::default()
        },
    );
    let fh = fs.open("f").await.unwrap();

    let fresh: Vec<Vec<u8>> = (0..3).map(|i| patterned(2 * MIB, 100 + i)).collect();
    for buf in &fresh {
        fs.append_block(fh, Bytes::from(buf.clone())).await.unwrap();
    }
    fs.flush(fh).await.unwrap();

    let props = store.get_properties("f").await.unwrap();
    assert_eq!(props.size as usize, 22 * MIB);
    assert_eq!(props.block_list.unwrap().len(), 7);

    let all = read_all(&fs, fh, 22 * MIB).await;
    assert_eq!(&all[..16 * MIB], &base[..], "existing bytes unchanged");
    assert_eq!(&all[16 * MIB..18 * MIB], &fresh[0][..]);
    assert_eq!(&all[18 * MIB..20 * MIB], &fresh[1][..]);
    assert_eq!(&all[20 * MIB..22 * MIB], &fresh[2][..]);
}

#[tokio::test]
async fn truncate_shrink_inside_a_block() {
    let store = Arc::new(MemStore::new());
    let fs = newfs(store.clone(), Config::default());

    let fh = fs.create("f").await.unwrap();
    fs.write(fh, 0, b"test data").await.unwrap();
    fs.flush(fh).await.unwrap();

    fs.truncate(fh, 5).await.unwrap();
    fs.flush(fh).await.unwrap();

    let props = store.get_properties("f").await.unwrap();
    assert_eq!(props.size, 5);
    let bytes = store.download_range("f", 0..5).await.unwrap();
    assert_eq!(bytes.as_ref(), b"test ");
}

#[tokio::test]
async fn truncate_shrink_drops_block_successors() {
    let store = Arc::new(MemStore::new());
    let content = b"testdatates1dat1tes2dat2tes3dat3tes4dat4";
    seed_chunked(&store, "f", content, 4).await;

    let fs = newfs(store.clone(), Config::default());
    let fh = fs.open("f").await.unwrap();
    fs.truncate(fh, 18).await.unwrap();
    fs.flush(fh).await.unwrap();

    let props = store.get_properties("f").await.unwrap();
    assert_eq!(props.size, 18);
    assert_eq!(props.block_list.unwrap().len(), 5);
    let bytes = store.download_range("f", 0..18).await.unwrap();
    assert_eq!(bytes.as_ref(), b"testdatates1dat1te");
}

#[tokio::test]
async fn truncate_extend_zero_fills() {
    let store = Arc::new(MemStore::new());
    let fs = newfs(store.clone(), Config::default());

    let fh = fs.create("f").await.unwrap();
    fs.write(fh, 0, b"test data").await.unwrap();
    fs.flush(fh).await.unwrap();

    fs.truncate(fh, 15).await.unwrap();
    fs.flush(fh).await.unwrap();

    let props = store.get_properties("f").await.unwrap();
    assert_eq!(props.size, 15);
    let bytes = store.download_range("f", 0..15).await.unwrap();
    assert_eq!(&bytes[..9], b"test data");
    assert_eq!(&bytes[9..], &[0u8; 6]);
}

#[tokio::test]
async fn write_flush_read_round_trip() {
    let store = Arc::new(MemStore::new());
    let content = patterned(40, 7);
    seed_chunked(&store, "f", &content, 8).await;

    let fs = newfs(store.clone(), Config::default());
    let fh = fs.open("f").await.unwrap();
    fs.write(fh, 13, b"roundtrip").await.unwrap();
    fs.flush(fh).await.unwrap();

    let mut buf = vec![0u8; 9];
    let n = fs.read(fh, 13, &mut buf).await.unwrap();
    assert_eq!(n, 9);
    assert_eq!(&buf, b"roundtrip");

    // the rest survived the read-modify-write
    let all = read_all(&fs, fh, 40).await;
    assert_eq!(&all[..13], &content[..13]);
    assert_eq!(&all[22..], &content[22..]);
}

#[tokio::test]
async fn reads_see_unflushed_writes() {
    let store = Arc::new(MemStore::new());
    let content = patterned(40, 11);
    seed_chunked(&store, "f", &content, 8).await;

    let fs = newfs(store.clone(), Config::default());
    let fh = fs.open("f").await.unwrap();
    fs.write(fh, 3, b"dirty").await.unwrap();

    let mut buf = vec![0u8; 10];
    fs.read(fh, 0, &mut buf).await.unwrap();
    assert_eq!(&buf[..3], &content[..3]);
    assert_eq!(&buf[3..8], b"dirty");
    assert_eq!(&buf[8..], &content[8..10]);
}

#[tokio::test]
async fn repeated_flush_is_idempotent() {
    let store = Arc::new(MemStore::new());
    let fs = newfs(store.clone(), Config::default());

    let fh = fs.create("f").await.unwrap();
    fs.write(fh, 0, &patterned(40, 2)).await.unwrap();
    fs.flush(fh).await.unwrap();
    let after_first = store.stats();

    fs.flush(fh).await.unwrap();
    assert_eq!(store.stats(), after_first, "second flush touches nothing");
}

#[tokio::test]
async fn release_flushes_and_closes() {
    let store = Arc::new(MemStore::new());
    let fs = newfs(store.clone(), Config::default());

    let fh = fs.create("f").await.unwrap();
    fs.write(fh, 0, b"bye").await.unwrap();
    fs.release(fh).await.unwrap();

    let props = store.get_properties("f").await.unwrap();
    assert_eq!(props.size, 3);
    // the handle is gone
    let err = fs.write(fh, 0, b"x").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::EBADF);
}

#[tokio::test]
async fn posix_error_surface() {
    let store = Arc::new(MemStore::new());
    let fs = newfs(store.clone(), Config::default());

    let err = fs.open("missing").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);

    let err = fs.unlink("missing").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);

    let fh = fs.create("f").await.unwrap();
    let err = fs.create("f").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::EEXIST);

    // reading at or past the end of file is a range error
    let mut buf = [0u8; 1];
    let err = fs.read(fh, 0, &mut buf).await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ERANGE);
    fs.write(fh, 0, b"abc").await.unwrap();
    let err = fs.read(fh, 3, &mut buf).await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ERANGE);

    fs.unlink("f").await.unwrap();
    let err = fs.stat("f").await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOENT);
}

#[tokio::test]
async fn unsupported_ops_are_gated_by_config() {
    let store = Arc::new(MemStore::new());
    let fs = newfs(store.clone(), Config::default());
    let fh = fs.create("f").await.unwrap();
    fs.release(fh).await.unwrap();

    // default: swallowed
    fs.chmod("f", 0o644).await.unwrap();

    let strict = newfs(
        store.clone(),
        Config {
            fail_unsupported_op: true,
            ..Default::default()
        },
    );
    let err = strict.chmod("f", 0o644).await.unwrap_err();
    assert_eq!(err.to_errno(), libc::ENOTSUP);

    // a hierarchical store applies it instead
    let hier = Arc::new(MemStore::new_hierarchical());
    let fs = newfs(hier.clone(), Config::default());
    let fh = fs.create("g").await.unwrap();
    fs.release(fh).await.unwrap();
    fs.chmod("g", 0o700).await.unwrap();
    assert_eq!(
        hier.get_acl("g").await.unwrap(),
        tsumiki_store::Acl::from_mode(0o700)
    );
}

#[tokio::test]
async fn shutdown_cancels_flushes() {
    let store = Arc::new(MemStore::new());
    let fs = newfs(store.clone(), Config::default());
    let fh = fs.create("f").await.unwrap();
    fs.write(fh, 0, b"data").await.unwrap();

    fs.shutdown();
    let err = fs.flush(fh).await.unwrap_err();
    assert_eq!(err.to_errno(), libc::EIO);
    // nothing reached the store after the create
    assert_eq!(store.stats().puts, 1);
}

#[tokio::test]
async fn acl_survives_flush_when_preserved() {
    let store = Arc::new(MemStore::new_hierarchical());
    let fs = newfs(
        store.clone(),
        Config {
            preserve_acl: true,
            block_size_mb: 1,
            ..Default::default()
        },
    );

    let fh = fs.create("f").await.unwrap();
    fs.write(fh, 0, &patterned(2 * MIB, 5)).await.unwrap();
    fs.flush(fh).await.unwrap();

    let custom = tsumiki_store::Acl::from_mode(0o750);
    store.set_acl("f", &custom).await.unwrap();

    fs.write(fh, 0, b"touch").await.unwrap();
    fs.flush(fh).await.unwrap();
    assert_eq!(store.get_acl("f").await.unwrap(), custom);
}
