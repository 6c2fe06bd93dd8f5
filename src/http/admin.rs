//! The `/admin/sync/*` and `/admin/needle` surface used by peers reconciling
//! replicas against each other.

use std::io::Read;

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use serde::Serialize;

use crate::errors::StoreError;
use crate::id::{parse_needle_id, parse_volume_id, NeedleKey};
use crate::needle::{Needle, NeedleHeader};
use crate::store::Store;

type Body = Full<Bytes>;

#[derive(Serialize)]
struct SyncStatus {
    volume_id: u32,
    collection: String,
    compact_revision: u16,
    file_count: usize,
    size: u64,
}

fn json_response(status: StatusCode, value: &impl Serialize) -> Response<Body> {
    let body = serde_json::to_vec(value).unwrap_or_default();
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

fn json_error(status: StatusCode, message: impl std::fmt::Display) -> Response<Body> {
    #[derive(Serialize)]
    struct Err { error: String }
    json_response(status, &Err { error: message.to_string() })
}

fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
    query.split('&').find_map(|pair| {
        let mut kv = pair.splitn(2, '=');
        if kv.next()? == name {
            kv.next()
        } else {
            None
        }
    })
}

fn lookup_volume<'a>(store: &'a Store, query: &str) -> Result<std::sync::Arc<crate::volume::Volume>, Response<Body>> {
    let vid_str = query_param(query, "volume")
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "missing volume parameter"))?;
    let vid = parse_volume_id(vid_str)
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, format!("invalid volume id: {vid_str}")))?;
    store
        .find_volume(vid)
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, format!("not found volume id {vid_str}")))
}

pub fn sync_status(store: &Store, query: &str) -> Response<Body> {
    let volume = match lookup_volume(store, query) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    json_response(
        StatusCode::OK,
        &SyncStatus {
            volume_id: volume.volume_id(),
            collection: volume.collection(),
            compact_revision: volume.compact_revision(),
            file_count: volume.count(),
            size: volume.size(),
        },
    )
}

pub fn index_content(store: &Store, query: &str) -> Response<Body> {
    let volume = match lookup_volume(store, query) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match volume.index_snapshot() {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/octet-stream")
            .body(Full::new(Bytes::from(bytes)))
            .unwrap(),
        Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// `/admin/sync/data` — returns the raw bytes of one needle record at
/// `offset` (padded units) within `.dat`, gated on `revision` matching the
/// volume's current `CompactRevision`.
pub fn data_content(store: &Store, query: &str) -> Response<Body> {
    let volume = match lookup_volume(store, query) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let requested_revision: u16 = query_param(query, "revision").and_then(|s| s.parse().ok()).unwrap_or(0);
    if requested_revision != volume.compact_revision() {
        return json_error(
            StatusCode::EXPECTATION_FAILED,
            format!(
                "requested volume revision is {requested_revision}, but current revision is {}",
                volume.compact_revision()
            ),
        );
    }

    let offset_padded: u32 = query_param(query, "offset").and_then(|s| s.parse().ok()).unwrap_or(0);
    let size: u32 = query_param(query, "size").and_then(|s| s.parse().ok()).unwrap_or(0);

    let mut reader = match volume.open_dat_reader() {
        Ok(f) => f,
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    use std::io::{Seek, SeekFrom};
    if reader.seek(SeekFrom::Start(offset_padded as u64 * 8)).is_err() {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "seek failed");
    }
    let mut content = vec![0u8; size as usize];
    if reader.read_exact(&mut content).is_err() {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, "short read");
    }

    let expected_id: NeedleKey = query_param(query, "id").and_then(|s| s.parse().ok()).unwrap_or(0);
    let header = match NeedleHeader::read(&mut std::io::Cursor::new(&content)) {
        Ok(h) => h,
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    if expected_id != 0 && expected_id != header.key {
        return json_error(
            StatusCode::NOT_FOUND,
            format!("expected file entry id {expected_id}, but found {}", header.key),
        );
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/octet-stream")
        .body(Full::new(Bytes::from(content)))
        .unwrap()
}

/// `/admin/sync/vol_data` — the entire `.dat` file, lz4-compressed, with
/// single-range support for resuming an interrupted transfer.
pub fn vol_data(store: &Store, query: &str, range_header: Option<&str>) -> Response<Body> {
    let volume = match lookup_volume(store, query) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut file = match volume.open_dat_reader() {
        Ok(f) => f,
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    };
    let total_size = match file.metadata() {
        Ok(m) => m.len(),
        Err(e) => return json_error(StatusCode::INTERNAL_SERVER_ERROR, e),
    };

    let mut raw = Vec::new();
    let read_result = match range_header {
        None => file.read_to_end(&mut raw).map(|_| ()),
        Some(header) => {
            let ranges = match super::range::parse_range(header, total_size as i64) {
                Ok(r) if r.len() == 1 => r,
                Ok(_) => {
                    // Multi-range volume transfers are not supported.
                    return Response::builder()
                        .status(StatusCode::NOT_IMPLEMENTED)
                        .body(Full::new(Bytes::new()))
                        .unwrap();
                }
                Err(_) => {
                    return Response::builder()
                        .status(StatusCode::RANGE_NOT_SATISFIABLE)
                        .body(Full::new(Bytes::new()))
                        .unwrap();
                }
            };
            use std::io::{Seek, SeekFrom};
            let r = ranges[0];
            file.seek(SeekFrom::Start(r.start))
                .and_then(|_| {
                    raw.resize(r.length as usize, 0);
                    file.read_exact(&mut raw)
                })
        }
    };
    if let Err(e) = read_result {
        return json_error(StatusCode::INTERNAL_SERVER_ERROR, e);
    }

    let compressed = lz4_flex::compress_prepend_size(&raw);
    let mut builder = Response::builder()
        .header("Accept-Ranges", "bytes")
        .header("Content-Disposition", format!("filename=\"{}.dat.lz4\"", volume.volume_id()))
        .header("Content-Encoding", "lz4")
        .header("X-Content-Length", raw.len().to_string());

    if let Some(header) = range_header {
        if let Ok(ranges) = super::range::parse_range(header, total_size as i64) {
            if let Some(r) = ranges.first() {
                builder = builder
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header("Content-Range", r.content_range(total_size));
            }
        }
    }

    builder.body(Full::new(Bytes::from(compressed))).unwrap()
}

/// `/admin/needle` — a single needle plus its framing metadata exposed as
/// `Seaweed-*` headers, keyed by `volume`+`nid` query parameters.
pub fn get_needle(store: &Store, query: &str) -> Response<Body> {
    let vid_str = match query_param(query, "volume") {
        Some(s) => s,
        None => return json_error(StatusCode::BAD_REQUEST, "missing volume parameter"),
    };
    let vid = match parse_volume_id(vid_str) {
        Ok(v) => v,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, format!("parsing volume error: {vid_str}")),
    };
    let nid = match query_param(query, "nid") {
        Some(s) => s,
        None => return json_error(StatusCode::BAD_REQUEST, "missing nid parameter"),
    };
    let (key, cookie) = match parse_needle_id(nid) {
        Ok(v) => v,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, format!("parsing fid ({nid}) error: {e}")),
    };

    let needle: Needle = match store.read_needle(vid, key, cookie) {
        Ok(n) => n,
        Err(e @ StoreError::CookieMismatch) | Err(e @ StoreError::NotFound) => {
            return json_error(StatusCode::NOT_FOUND, format!("read needle ({vid},{nid}) error: {e}"));
        }
        Err(e) => return json_error(StatusCode::NOT_FOUND, e),
    };

    let mut builder = Response::builder()
        .header("Seaweed-Flags", format!("{:x}", needle.flags))
        .header("Seaweed-Checksum", format!("{:x}", needle.checksum()));
    if let Some(lm) = needle.last_modified {
        builder = builder.header("Seaweed-LastModified", format!("{lm:x}"));
    }
    if let Some(name) = &needle.name {
        builder = builder.header("Seaweed-Name", String::from_utf8_lossy(name).to_string());
    }
    if let Some(mime) = &needle.mime {
        builder = builder.header("Seaweed-Mime", String::from_utf8_lossy(mime).to_string());
    }

    builder.body(Full::new(Bytes::from(needle.data))).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_finds_value() {
        assert_eq!(query_param("volume=3&revision=1", "volume"), Some("3"));
        assert_eq!(query_param("volume=3&revision=1", "revision"), Some("1"));
        assert_eq!(query_param("volume=3", "missing"), None);
    }
}
