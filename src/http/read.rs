//! The GET/HEAD read pipeline: resolve a file id, apply conditional-request
//! and content-negotiation rules, and write the (possibly ranged) response
//! body.

use bytes::Bytes;
use http::{HeaderMap, Method, Response, StatusCode};
use http_body_util::Full;

use crate::chunk::ChunkManifest;
use crate::collaborators;
use crate::errors::StoreError;
use crate::id::{parse_needle_id, parse_volume_id};
use crate::needle::Needle;
use crate::remote::MasterLookup;
use crate::store::Store;

pub struct ReadRequest<'a> {
    pub method: Method,
    pub path: &'a str,
    pub query: &'a str,
    pub headers: &'a HeaderMap,
}

type Body = Full<Bytes>;

pub fn handle(store: &Store, master: Option<&dyn MasterLookup>, req: ReadRequest) -> Response<Body> {
    let (vid_str, nid_with_ext, rest_filename) = match split_path(req.path) {
        Some(parts) => parts,
        None => return status_only(StatusCode::BAD_REQUEST),
    };

    let (nid_str, mut ext) = split_ext(nid_with_ext);

    let vid = match parse_volume_id(vid_str) {
        Ok(v) => v,
        Err(_) => return status_only(StatusCode::BAD_REQUEST),
    };
    let (key, cookie) = match parse_needle_id(nid_str) {
        Ok(v) => v,
        Err(_) => return status_only(StatusCode::BAD_REQUEST),
    };

    let needle = match store.read_needle(vid, key, cookie) {
        Ok(n) => n,
        Err(StoreError::NotFound) if !store.has_volume_locally(vid) => {
            if let Some(master) = master {
                let locations = master.locate_volume(vid);
                if let Some(target) = locations.first() {
                    return redirect(&format!("{target}{}", req.path));
                }
            }
            return status_only(StatusCode::NOT_FOUND);
        }
        Err(_) => return status_only(StatusCode::NOT_FOUND),
    };

    if let Some(resp) = check_conditional(&needle, req.headers) {
        return resp;
    }

    let mut filename = rest_filename.map(|s| s.to_string());
    let mut mime_type = None;
    let etag = compute_etag(&needle);

    let body: Vec<u8> = if needle.is_chunk_manifest() {
        let manifest_bytes = if needle.is_gzipped() {
            match collaborators::gunzip(&needle.data) {
                Ok(d) => d,
                Err(_) => needle.data.clone(),
            }
        } else {
            needle.data.clone()
        };
        let unwrapped = Needle { data: manifest_bytes, ..needle.clone() };
        let manifest = match ChunkManifest::from_needle(&unwrapped) {
            Ok(m) => m,
            Err(_) => return status_only(StatusCode::INTERNAL_SERVER_ERROR),
        };
        if filename.is_none() {
            filename = manifest.name.clone();
        }
        if let Some(mime) = manifest.mime.clone() {
            if !mime.starts_with("application/octet-stream") {
                mime_type = Some(mime);
            }
        }

        let mut reader = match crate::chunk::ChunkedFileReader::new(store, &manifest, 0) {
            Ok(r) => r,
            Err(_) => return status_only(StatusCode::INTERNAL_SERVER_ERROR),
        };
        let mut buf = Vec::new();
        if std::io::Read::read_to_end(&mut reader, &mut buf).is_err() {
            return status_only(StatusCode::INTERNAL_SERVER_ERROR);
        }
        buf
    } else {
        if filename.is_none() {
            if let Some(name) = &needle.name {
                let name = String::from_utf8_lossy(name).to_string();
                if ext.is_none() {
                    ext = name.rfind('.').map(|i| name[i..].to_string());
                }
                filename = Some(name);
            }
        }
        if let Some(mime) = &needle.mime {
            let mime = String::from_utf8_lossy(mime).to_string();
            if !mime.starts_with("application/octet-stream") {
                mime_type = Some(mime);
            }
        }

        let mut data = needle.data.clone();
        let mut content_encoding_gzip = false;
        if needle.is_gzipped() && collaborators::should_gzip(ext.as_deref(), mime_type.as_deref()) {
            if collaborators::accepts_gzip(header_str(req.headers, "accept-encoding")) {
                content_encoding_gzip = true;
            } else if let Ok(plain) = collaborators::gunzip(&data) {
                data = plain;
            }
        }

        if matches!(ext.as_deref(), Some(".png") | Some(".jpg") | Some(".jpeg") | Some(".gif")) {
            let (width, height) = parse_dimensions(req.query);
            if width != 0 || height != 0 {
                if let Ok((resized, _w, _h)) = collaborators::resize(ext.as_deref().unwrap(), &data, width, height) {
                    data = resized;
                }
            }
        }

        let mut resp = write_response_content(filename.as_deref(), mime_type.as_deref(), &data, &req.method, req.headers);
        resp.headers_mut().insert("Etag", etag.parse().unwrap());
        if let Some(lm) = needle.last_modified {
            resp.headers_mut().insert("Last-Modified", format_http_date(lm).parse().unwrap());
        }
        if content_encoding_gzip {
            resp.headers_mut().insert("Content-Encoding", "gzip".parse().unwrap());
        }
        return resp;
    };

    let mut resp = write_response_content(filename.as_deref(), mime_type.as_deref(), &body, &req.method, req.headers);
    resp.headers_mut().insert("Etag", etag.parse().unwrap());
    if let Some(lm) = needle.last_modified {
        resp.headers_mut().insert("Last-Modified", format_http_date(lm).parse().unwrap());
    }
    resp.headers_mut().insert("X-File-Store", "chunked".parse().unwrap());
    resp
}

fn format_http_date(unix_secs: u64) -> String {
    use chrono::{DateTime, Utc};
    let dt = DateTime::<Utc>::from_timestamp(unix_secs as i64, 0).unwrap_or_default();
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Splits `/<vid>,<nid>[.ext]` or `/<vid>/<nid>[.ext][/<filename>]` into
/// `(vid, nid_with_ext, optional_filename)`.
fn split_path(path: &str) -> Option<(&str, &str, Option<&str>)> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    let (first, rest) = match path.find('/') {
        Some(i) => (&path[..i], Some(&path[i + 1..])),
        None => (path, None),
    };

    if let Some(comma) = first.find(',') {
        return Some((&first[..comma], &first[comma + 1..], rest));
    }

    // `/<vid>/<nid>[.ext][/<filename>]` form: the first segment is the vid,
    // and `rest`'s own first segment is the needle id.
    let rest = rest?;
    let (nid, filename) = match rest.find('/') {
        Some(i) => (&rest[..i], Some(&rest[i + 1..])),
        None => (rest, None),
    };
    Some((first, nid, filename))
}

fn split_ext(s: &str) -> (&str, Option<String>) {
    match s.rfind('.') {
        Some(i) if i > 0 => (&s[..i], Some(s[i..].to_string())),
        _ => (s, None),
    }
}

fn parse_dimensions(query: &str) -> (u32, u32) {
    let mut width = 0u32;
    let mut height = 0u32;
    for pair in query.split('&') {
        let mut kv = pair.splitn(2, '=');
        let key = kv.next().unwrap_or("");
        let value = kv.next().unwrap_or("");
        match key {
            "width" => width = value.parse().unwrap_or(0),
            "height" => height = value.parse().unwrap_or(0),
            _ => {}
        }
    }
    (width, height)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn compute_etag(n: &Needle) -> String {
    let combined = (n.key as u128) ^ ((n.cookie as u128) << 64) ^ (n.checksum() as u128);
    format!("\"{combined:x}\"")
}

fn check_conditional(n: &Needle, headers: &HeaderMap) -> Option<Response<Body>> {
    if let Some(last_modified) = n.last_modified {
        if let Some(since) = header_str(headers, "if-modified-since") {
            if let Ok(t) = chrono::NaiveDateTime::parse_from_str(since, "%a, %d %b %Y %H:%M:%S GMT") {
                if t.and_utc().timestamp() as u64 >= last_modified {
                    return Some(status_only(StatusCode::NOT_MODIFIED));
                }
            }
        }
    }

    let etag = compute_etag(n);
    if let Some(inm) = header_str(headers, "if-none-match") {
        if inm == etag {
            return Some(status_only(StatusCode::NOT_MODIFIED));
        }
    }
    None
}

fn status_only(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

fn redirect(location: &str) -> Response<Body> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header("Location", location)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// Writes `data` as the response body honoring HEAD, `Range`, and
/// multipart/byteranges, mirroring `writeResponseContent`.
fn write_response_content(
    filename: Option<&str>,
    mime_type: Option<&str>,
    data: &[u8],
    method: &Method,
    headers: &HeaderMap,
) -> Response<Body> {
    let total_size = data.len() as u64;
    let content_type = mime_type
        .map(|s| s.to_string())
        .or_else(|| filename.and_then(|f| {
            let ext = f.rsplit('.').next().map(|e| format!(".{e}"));
            ext.and_then(|e| mime_guess::from_ext(e.trim_start_matches('.')).first_raw())
                .map(|s| s.to_string())
        }));

    let mut builder = Response::builder().header("Accept-Ranges", "bytes");
    if let Some(ct) = &content_type {
        builder = builder.header("Content-Type", ct.clone());
    }
    if let Some(name) = filename {
        if !name.is_empty() {
            let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
            builder = builder.header("Content-Disposition", format!("filename=\"{escaped}\""));
        }
    }

    if *method == Method::HEAD {
        return builder
            .header("Content-Length", total_size.to_string())
            .body(Full::new(Bytes::new()))
            .unwrap();
    }

    let range_header = header_str(headers, "range");
    let range_header = match range_header {
        Some(h) => h,
        None => {
            return builder
                .header("Content-Length", total_size.to_string())
                .body(Full::new(Bytes::copy_from_slice(data)))
                .unwrap();
        }
    };

    let ranges = match super::range::parse_range(range_header, total_size as i64) {
        Ok(r) => r,
        Err(_) => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .body(Full::new(Bytes::new()))
                .unwrap();
        }
    };

    if super::range::sum_ranges_size(&ranges) > total_size {
        // Defense against range-amplification attacks: ignore the range
        // request and serve the whole body.
        return builder
            .header("Content-Length", total_size.to_string())
            .body(Full::new(Bytes::copy_from_slice(data)))
            .unwrap();
    }

    if ranges.len() == 1 {
        let r = ranges[0];
        let chunk = &data[r.start as usize..(r.start + r.length) as usize];
        return builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header("Content-Length", r.length.to_string())
            .header("Content-Range", r.content_range(total_size))
            .body(Full::new(Bytes::copy_from_slice(chunk)))
            .unwrap();
    }

    for r in &ranges {
        if r.start > total_size {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .body(Full::new(Bytes::new()))
                .unwrap();
        }
    }

    let boundary = format!("{:032x}", rand::random::<u128>());
    let content_type_for_parts = content_type.clone().unwrap_or_else(|| "application/octet-stream".to_string());
    let mut body = Vec::new();
    for r in &ranges {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(format!("Content-Type: {content_type_for_parts}\r\n").as_bytes());
        body.extend_from_slice(format!("Content-Range: {}\r\n\r\n", r.content_range(total_size)).as_bytes());
        body.extend_from_slice(&data[r.start as usize..(r.start + r.length) as usize]);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    Response::builder()
        .status(StatusCode::PARTIAL_CONTENT)
        .header("Content-Type", format!("multipart/byteranges; boundary={boundary}"))
        .header("Content-Length", body.len().to_string())
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_handles_comma_form() {
        let (vid, nid, filename) = split_path("/3,01637037d6.jpg/photo.jpg").unwrap();
        assert_eq!(vid, "3");
        assert_eq!(nid, "01637037d6.jpg");
        assert_eq!(filename, Some("photo.jpg"));
    }

    #[test]
    fn split_path_handles_slash_form() {
        let (vid, nid, filename) = split_path("/3/01637037d6").unwrap();
        assert_eq!(vid, "3");
        assert_eq!(nid, "01637037d6");
        assert_eq!(filename, None);
    }

    #[test]
    fn split_ext_extracts_trailing_extension() {
        assert_eq!(split_ext("01637037d6.jpg"), ("01637037d6", Some(".jpg".to_string())));
        assert_eq!(split_ext("01637037d6"), ("01637037d6", None));
    }
}
