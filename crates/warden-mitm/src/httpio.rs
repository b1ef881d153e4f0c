//! Incremental HTTP/1.1 request parsing over a plain or TLS-terminated
//! stream, generalized from `oisp-decode::http::parse_request`'s one-shot
//! `httparse` decode into a loop that keeps reading until the header block is
//! complete, so it works over a keep-alive connection one request at a time.

use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt};

pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: HashMap<String, String>,
}

/// Read one request's header block from `stream`, using and refilling `buf`
/// as scratch space. Returns `Ok(None)` on a clean close before any bytes
/// arrived (the ordinary end of a keep-alive loop). A parse error or a close
/// mid-headers is reported as `ClientProtocolError` by the caller.
pub async fn read_request_head<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<(RequestHead, usize)>>
where
    S: AsyncRead + Unpin,
{
    loop {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf) {
            Ok(httparse::Status::Complete(consumed)) => {
                let mut header_map = HashMap::new();
                for header in req.headers.iter() {
                    header_map.insert(
                        header.name.to_string(),
                        String::from_utf8_lossy(header.value).to_string(),
                    );
                }
                let head = RequestHead {
                    method: req.method.unwrap_or_default().to_string(),
                    target: req.path.unwrap_or_default().to_string(),
                    headers: header_map,
                };
                return Ok(Some((head, consumed)));
            }
            Ok(httparse::Status::Partial) => {}
            Err(_) => return Ok(None),
        }

        let mut chunk = [0u8; 8192];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Case-insensitive header lookup (client-supplied casing is preserved for
/// exact rule matching elsewhere; this is only for internal bookkeeping like
/// finding `Host`).
pub fn header_ci<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Read exactly `len` more body bytes, using whatever is already buffered
/// past the header block first.
pub async fn read_body<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    already_buffered: &[u8],
    len: usize,
) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut body = already_buffered.to_vec();
    while body.len() < len {
        let mut chunk = [0u8; 8192];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(len);
    buf.clear();
    Ok(body)
}
