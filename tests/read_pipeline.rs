//! End-to-end coverage of the HTTP read pipeline against real on-disk
//! volumes, exercised without spinning up a listener: `http::read::handle`
//! is a plain synchronous function, so these drive it directly against a
//! real `Volume` and `Store`.

use std::sync::Arc;

use http::{HeaderMap, Method, StatusCode};
use tempfile::tempdir;

use haystack_store::chunk::{ChunkEntry, ChunkManifest};
use haystack_store::disk_location::DiskLocation;
use haystack_store::http::read::{handle, ReadRequest};
use haystack_store::id::format_needle_id;
use haystack_store::needle::Needle;
use haystack_store::store::Store;
use haystack_store::volume::Volume;

fn store_with_one_volume(vid: u32) -> (tempfile::TempDir, Store) {
    let dir = tempdir().unwrap();
    let dat = dir.path().join(format!("{vid}.dat"));
    let idx = dir.path().join(format!("{vid}.idx"));
    let volume = Volume::create(dat, idx, vid, String::new()).unwrap();
    let loc = DiskLocation::new(dir.path().to_path_buf(), 8);
    loc.add(vid, Arc::new(volume));
    (dir, Store::new(vec![loc]))
}

fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in pairs {
        map.insert(*k, v.parse().unwrap());
    }
    map
}

#[test]
fn round_trip_read_returns_stored_bytes() {
    let (_dir, store) = store_with_one_volume(3);
    let needle = Needle::new(0x4ed4, 0xc8116e41, b"hello world".to_vec());
    store.write_needle(3, &needle).unwrap();

    let nid = format_needle_id(0x4ed4, 0xc8116e41);
    let path = format!("/3,{nid}");
    let empty = headers(&[]);
    let resp = handle(
        &store,
        None,
        ReadRequest { method: Method::GET, path: &path, query: "", headers: &empty },
    );

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"hello world");
    assert!(resp.headers().contains_key("etag"));
}

#[test]
fn range_request_returns_partial_content() {
    let (_dir, store) = store_with_one_volume(3);
    let needle = Needle::new(1, 1, b"0123456789".to_vec());
    store.write_needle(3, &needle).unwrap();

    let nid = format_needle_id(1, 1);
    let path = format!("/3,{nid}");
    let h = headers(&[("range", "bytes=2-5")]);
    let resp = handle(&store, None, ReadRequest { method: Method::GET, path: &path, query: "", headers: &h });

    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(resp.body().as_ref(), b"2345");
    assert_eq!(
        resp.headers().get("content-range").unwrap().to_str().unwrap(),
        "bytes 2-5/10"
    );
}

#[test]
fn conditional_request_with_matching_etag_is_not_modified() {
    let (_dir, store) = store_with_one_volume(3);
    let needle = Needle::new(2, 2, b"etag me".to_vec());
    store.write_needle(3, &needle).unwrap();
    let nid = format_needle_id(2, 2);
    let path = format!("/3,{nid}");

    let empty = headers(&[]);
    let first = handle(&store, None, ReadRequest { method: Method::GET, path: &path, query: "", headers: &empty });
    let etag = first.headers().get("etag").unwrap().to_str().unwrap().to_string();

    let h = headers(&[("if-none-match", &etag)]);
    let second = handle(&store, None, ReadRequest { method: Method::GET, path: &path, query: "", headers: &h });
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
}

#[test]
fn cookie_mismatch_is_reported_as_not_found() {
    let (_dir, store) = store_with_one_volume(3);
    let needle = Needle::new(5, 0xaaaa_aaaa, b"secret".to_vec());
    store.write_needle(3, &needle).unwrap();

    let wrong_nid = format_needle_id(5, 0xbbbb_bbbb);
    let path = format!("/3,{wrong_nid}");
    let empty = headers(&[]);
    let resp = handle(&store, None, ReadRequest { method: Method::GET, path: &path, query: "", headers: &empty });
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[test]
fn delta_suffix_resolves_a_neighboring_key() {
    let (_dir, store) = store_with_one_volume(3);
    let base_key = 0x1000u64;
    let cookie = 0x9999_9999u32;
    store.write_needle(3, &Needle::new(base_key + 7, cookie, b"neighbor".to_vec())).unwrap();

    let base_nid = format_needle_id(base_key, cookie);
    let path = format!("/3,{base_nid}_7");
    let empty = headers(&[]);
    let resp = handle(&store, None, ReadRequest { method: Method::GET, path: &path, query: "", headers: &empty });

    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), b"neighbor");
}

#[test]
fn gzipped_needle_is_decompressed_for_clients_without_gzip_support() {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let (_dir, store) = store_with_one_volume(3);
    let plain = b"some plain text that compresses fine".to_vec();
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(&plain).unwrap();
    let compressed = enc.finish().unwrap();

    let needle = Needle::new(9, 9, compressed).gzipped(true);
    store.write_needle(3, &needle).unwrap();
    let nid = format_needle_id(9, 9);
    let path = format!("/3,{nid}");

    let empty = headers(&[]);
    let resp = handle(&store, None, ReadRequest { method: Method::GET, path: &path, query: "", headers: &empty });
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.body().as_ref(), plain.as_slice());
    assert!(!resp.headers().contains_key("content-encoding"));

    let gzip_client = headers(&[("accept-encoding", "gzip, deflate")]);
    let resp2 = handle(&store, None, ReadRequest { method: Method::GET, path: &path, query: "", headers: &gzip_client });
    assert_eq!(resp2.status(), StatusCode::OK);
    assert_eq!(resp2.headers().get("content-encoding").unwrap(), "gzip");
}

#[test]
fn chunked_manifest_reassembles_the_full_file() {
    let (_dir, store) = store_with_one_volume(3);

    let part_a = b"first half..".to_vec();
    let part_b = b"..second half".to_vec();
    store.write_needle(3, &Needle::new(100, 1, part_a.clone())).unwrap();
    store.write_needle(3, &Needle::new(101, 1, part_b.clone())).unwrap();

    let manifest = ChunkManifest {
        name: Some("combined.txt".to_string()),
        mime: Some("text/plain".to_string()),
        size: (part_a.len() + part_b.len()) as u64,
        chunks: vec![
            ChunkEntry { fid: format!("3,{}", format_needle_id(100, 1)), offset: 0, size: part_a.len() as u64 },
            ChunkEntry { fid: format!("3,{}", format_needle_id(101, 1)), offset: part_a.len() as u64, size: part_b.len() as u64 },
        ],
    };
    let manifest_needle = Needle::new(200, 1, manifest.to_json().unwrap()).chunk_manifest(true);
    store.write_needle(3, &manifest_needle).unwrap();

    let nid = format_needle_id(200, 1);
    let path = format!("/3,{nid}");
    let empty = headers(&[]);
    let resp = handle(&store, None, ReadRequest { method: Method::GET, path: &path, query: "", headers: &empty });

    assert_eq!(resp.status(), StatusCode::OK);
    let mut expected = part_a;
    expected.extend_from_slice(&part_b);
    assert_eq!(resp.body().as_ref(), expected.as_slice());
    assert_eq!(resp.headers().get("x-file-store").unwrap(), "chunked");
}

#[test]
fn head_request_omits_body_but_reports_content_length() {
    let (_dir, store) = store_with_one_volume(3);
    store.write_needle(3, &Needle::new(1, 1, b"twelve bytes".to_vec())).unwrap();
    let nid = format_needle_id(1, 1);
    let path = format!("/3,{nid}");

    let empty = headers(&[]);
    let resp = handle(&store, None, ReadRequest { method: Method::HEAD, path: &path, query: "", headers: &empty });
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.body().as_ref().is_empty());
    assert_eq!(resp.headers().get("content-length").unwrap(), "12");
}
