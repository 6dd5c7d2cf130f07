//! Request parsing and echo-frame encoding shared by the `origin-echo`
//! binary and exercised directly by `h3smug-core`'s classifier tests, so
//! the frame format under test is the one a real origin actually writes.

pub const H_NAME: &[u8] = b"####H_NAME####";
pub const H_VALUE: &[u8] = b"####H_VALUE####";
pub const BODY_SIGNAL: &[u8] = b"####BODY####";
pub const REQ_END: &[u8] = b"####REQ_END####";

/// One parsed HTTP/1 request, ready to be written as an echo frame.
pub struct EchoRequest {
    pub smuggling_id: Vec<u8>,
    pub headers: Vec<(Vec<u8>, Vec<u8>)>,
    pub body: Vec<u8>,
}

/// Read until the header block is complete, then keep reading until
/// `Content-Length` (if any) is satisfied.
pub fn content_length_of(header_block: &[u8]) -> usize {
    header_block
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .find_map(|line| {
            let colon = find_subslice(line, b":")?;
            let (name, value) = line.split_at(colon);
            if name.eq_ignore_ascii_case(b"content-length") {
                std::str::from_utf8(&value[1..]).ok()?.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0)
}

pub fn parse_request(raw: &[u8]) -> EchoRequest {
    let split = find_subslice(raw, b"\r\n\r\n").unwrap_or(raw.len());
    let header_block = &raw[..split];
    let body = raw.get(split + 4..).unwrap_or(&[]).to_vec();

    let mut lines = header_block.split(|&b| b == b'\n').map(|line| line.strip_suffix(b"\r").unwrap_or(line));
    let mut headers = Vec::new();

    if let Some(request_line) = lines.next() {
        let parts: Vec<&[u8]> = request_line.split(|&b| b == b' ').collect();
        if parts.len() == 3 {
            headers.push((b"req-mthd".to_vec(), parts[0].to_vec()));
            headers.push((b"req-pth".to_vec(), parts[1].to_vec()));
            headers.push((b"req-vrsn".to_vec(), parts[2].to_vec()));
        } else {
            tracing::warn!(line = %String::from_utf8_lossy(request_line), "malformed request line");
            headers.push((b"malformed-request-line".to_vec(), request_line.to_vec()));
        }
    }

    let mut smuggling_id = None;
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some(sep) = find_subslice(line, b": ") else { continue };
        let (name, value) = line.split_at(sep);
        let value = &value[2..];
        if name.eq_ignore_ascii_case(b"smuggling-id") {
            smuggling_id = Some(value.to_vec());
        } else {
            headers.push((name.to_vec(), value.to_vec()));
        }
    }
    let smuggling_id = smuggling_id.unwrap_or_else(|| b"None".to_vec());
    headers.push((b"smuggling-id".to_vec(), smuggling_id.clone()));

    EchoRequest { smuggling_id, headers, body }
}

/// Encode a frame exactly as `h3smug_core::classifier` expects to read it
/// back: the id has its own trailing `####`, but each header value runs
/// directly up to the next marker with no closing `####` of its own.
pub fn build_frame_bytes(frame: &EchoRequest) -> Vec<u8> {
    let mut content = Vec::new();
    content.extend_from_slice(b"####REQ_ID_");
    content.extend_from_slice(&frame.smuggling_id);
    content.extend_from_slice(b"####");
    for (name, value) in &frame.headers {
        content.extend_from_slice(H_NAME);
        content.extend_from_slice(name);
        content.extend_from_slice(H_VALUE);
        content.extend_from_slice(value);
    }
    content.extend_from_slice(BODY_SIGNAL);
    content.extend_from_slice(&frame.body);
    content.extend_from_slice(REQ_END);
    content
}

pub fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_get_request() {
        let raw = b"GET /foo HTTP/1.1\r\nHost: example.com\r\nsmuggling-id: 42\r\n\r\n";
        let frame = parse_request(raw);
        assert_eq!(frame.smuggling_id, b"42");
        assert!(frame.headers.iter().any(|(n, v)| n == b"req-pth" && v == b"/foo"));
        assert!(frame.body.is_empty());
    }

    #[test]
    fn missing_smuggling_id_becomes_none_sentinel() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let frame = parse_request(raw);
        assert_eq!(frame.smuggling_id, b"None");
    }

    #[test]
    fn content_length_is_read_case_insensitively() {
        let header_block = b"POST / HTTP/1.1\r\nContent-Length: 5\r\nHost: x";
        assert_eq!(content_length_of(header_block), 5);
    }

    #[test]
    fn header_values_are_not_followed_by_their_own_closing_marker() {
        let frame = EchoRequest { smuggling_id: b"7".to_vec(), headers: vec![(b":method".to_vec(), b"GET".to_vec())], body: vec![] };
        let built = build_frame_bytes(&frame);
        let expected = [b"####REQ_ID_7####".as_slice(), H_NAME, b":method", H_VALUE, b"GET", BODY_SIGNAL, REQ_END].concat();
        assert_eq!(built, expected);
        assert!(find_subslice(&built, b"GET####H_NAME").is_none(), "value must not be padded with a closing marker");
    }
}
