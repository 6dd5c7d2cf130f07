//! Outcome Classifier: reads the origin's echo file and decides whether a
//! request's malicious load was accepted, normalized, rejected, or timed
//! out, reporting each decision back to the owning char-tables.

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::grammar::Grammar;
use crate::model::{MaliciousLoad, Outcome, Request};
use crate::transport::Response;

const RACE_RETRY_DELAY: Duration = Duration::from_millis(100);
const STALE_FRAME_RETRIES: usize = 2;

const REQ_ID_PREFIX: &[u8] = b"####REQ_ID_";
const SIGNAL: &[u8] = b"####";
const H_NAME: &[u8] = b"####H_NAME####";
const H_VALUE: &[u8] = b"####H_VALUE####";
const BODY: &[u8] = b"####BODY####";
const REQ_END: &[u8] = b"####REQ_END####";

/// One parsed echo frame from the origin's request log.
#[derive(Debug, Clone)]
pub struct EchoFrame {
    /// The `request_id` the origin recorded, read back from the frame.
    pub request_id: u64,
    /// Every header the origin received, in receipt order.
    pub headers: Vec<(Bytes, Bytes)>,
    /// The request body the origin received, if any.
    pub body: Option<Bytes>,
}

/// Read and parse the origin's echo file, tolerating a request that hasn't
/// been written yet or is still mid-write.
///
/// Returns `Ok(None)` when the file is absent, when the recorded id doesn't
/// match `expected_id` (not our request, or not echoed yet), and after the
/// race-retry budget is exhausted on a still-malformed frame.
pub async fn read_echo_file(path: &Path, expected_id: u64) -> Result<Option<EchoFrame>> {
    if tokio::fs::metadata(path).await.is_err() {
        return Ok(None);
    }
    for attempt in 0..STALE_FRAME_RETRIES {
        tokio::time::sleep(RACE_RETRY_DELAY).await;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(_) => return Ok(None),
        };
        match parse_echo_frame(&bytes) {
            Ok(frame) => {
                return Ok(if frame.request_id == expected_id { Some(frame) } else { None });
            }
            Err(err) if attempt + 1 < STALE_FRAME_RETRIES => {
                tracing::debug!(attempt, %err, "echo file not fully written yet, retrying");
            }
            Err(_) => return Ok(None),
        }
    }
    Ok(None)
}

fn parse_echo_frame(data: &[u8]) -> Result<EchoFrame> {
    let rest = data
        .strip_prefix(REQ_ID_PREFIX)
        .ok_or_else(|| Error::Internal("echo file does not start with ####REQ_ID_".into()))?;
    let (id_bytes, rest) = split_at_signal(rest, SIGNAL)?;
    let id_str = std::str::from_utf8(id_bytes).map_err(|_| Error::Internal("echo id is not UTF-8".into()))?;
    if id_str == "None" {
        return Err(Error::Internal("echo file carries sentinel None id".into()));
    }
    let request_id: u64 = id_str
        .parse()
        .map_err(|_| Error::Internal(format!("echo id is not numeric: {id_str}")))?;
    let (headers, body) = parse_headers_and_body(rest)?;
    Ok(EchoFrame { request_id, headers, body })
}

fn parse_headers_and_body(mut data: &[u8]) -> Result<(Vec<(Bytes, Bytes)>, Option<Bytes>)> {
    let mut headers = Vec::new();
    loop {
        if let Some(rest) = data.strip_prefix(H_NAME) {
            let (name, rest) = split_at_signal(rest, H_VALUE)?;
            let (value, rest) = split_before_next_marker(rest)?;
            headers.push((Bytes::copy_from_slice(name), Bytes::copy_from_slice(value)));
            data = rest;
        } else if let Some(rest) = data.strip_prefix(BODY) {
            let body_bytes = rest
                .strip_suffix(REQ_END)
                .ok_or_else(|| Error::Internal("echo body missing ####REQ_END#### suffix".into()))?;
            return Ok((headers, Some(Bytes::copy_from_slice(body_bytes))));
        } else if data.strip_prefix(REQ_END).is_some() {
            return Ok((headers, None));
        } else {
            return Err(Error::Internal(
                "echo file malformed: expected ####H_NAME####, ####BODY####, or ####REQ_END####".into(),
            ));
        }
    }
}

fn split_at_signal<'a>(data: &'a [u8], signal: &[u8]) -> Result<(&'a [u8], &'a [u8])> {
    let index = find_subslice(data, signal)
        .ok_or_else(|| Error::Internal(format!("expected {:?} but did not find it", String::from_utf8_lossy(signal))))?;
    Ok((&data[..index], &data[index + signal.len()..]))
}

/// A header value has no closing marker of its own — it runs directly up
/// to whichever of `####H_NAME####`/`####BODY####`/`####REQ_END####` comes
/// next, unlike the id, which does have an explicit trailing `####`.
fn split_before_next_marker(data: &[u8]) -> Result<(&[u8], &[u8])> {
    [H_NAME, BODY, REQ_END]
        .into_iter()
        .filter_map(|marker| find_subslice(data, marker))
        .min()
        .map(|index| (&data[..index], &data[index..]))
        .ok_or_else(|| {
            Error::Internal("echo file malformed: header value has no following marker".into())
        })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| &haystack[i..i + needle.len()] == needle)
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    find_subslice(haystack, needle).is_some()
}

/// Classify a sent request against the transport's response and the
/// origin's echo file, mutating the owning char-tables as a side effect.
///
/// `echo_path` is the origin echo file configured for this run (see
/// `demos/origin-echo/` for the reference origin that writes it).
pub async fn classify(
    grammar: &mut Grammar,
    request: &Request,
    response: Option<&Response>,
    echo_path: &Path,
) -> Result<Outcome> {
    if request.malicious.all.is_empty() {
        return Ok(Outcome::RequestNotMalformed);
    }

    if let Some(frame) = read_echo_file(echo_path, request.id).await? {
        let outcome = classify_against_echo(grammar, &request.malicious, &frame);
        log_malicious_request(request, &frame, outcome);
        return Ok(outcome);
    }

    match response {
        None => {
            report_chars(grammar, &request.malicious, Outcome::Timeout);
            Ok(Outcome::Timeout)
        }
        Some(response) => {
            if response.status() == Some(200) {
                return Err(Error::ContractViolation);
            }
            report_chars(grammar, &request.malicious, Outcome::Rejected);
            Ok(Outcome::Rejected)
        }
    }
}

fn header_contains(headers: &[(Bytes, Bytes)], needle: &[u8]) -> bool {
    headers.iter().any(|(name, value)| contains_subslice(name, needle) || contains_subslice(value, needle))
}

fn classify_against_echo(grammar: &mut Grammar, malicious: &MaliciousLoad, frame: &EchoFrame) -> Outcome {
    for (table_name, (bytes, slot)) in &malicious.chars {
        let outcome = if header_contains(&frame.headers, bytes) { Outcome::Accepted } else { Outcome::Modified };
        if let Some(table) = grammar.char_tables_mut().get_mut(table_name) {
            if let Some(index) = find_entry_index(table, bytes, *slot) {
                table.report_result(index, outcome);
            }
        }
    }

    let found = malicious.all.iter().any(|entry| header_contains(&frame.headers, entry));
    if found { Outcome::Accepted } else { Outcome::Modified }
}

fn find_entry_index(table: &crate::model::CharTable, bytes: &Bytes, slot: crate::model::Slot) -> Option<usize> {
    (0..table.len()).find(|&i| {
        table.entry(i).is_some_and(|e| e.bytes == *bytes && e.slot == slot)
    })
}

fn report_chars(grammar: &mut Grammar, malicious: &MaliciousLoad, outcome: Outcome) {
    for (table_name, (bytes, slot)) in &malicious.chars {
        if let Some(table) = grammar.char_tables_mut().get_mut(table_name) {
            if let Some(index) = find_entry_index(table, bytes, *slot) {
                table.report_result(index, outcome);
            }
        }
    }
}

fn log_malicious_request(request: &Request, frame: &EchoFrame, outcome: Outcome) {
    if matches!(outcome, Outcome::Accepted | Outcome::Modified) {
        tracing::info!(
            target: "h3smug::request_log",
            request_id = request.id,
            outcome = ?outcome,
            outbound_headers = ?request.headers,
            echoed_headers = ?frame.headers,
            "malicious request classified"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_header_only_frame() {
        let frame = parse_echo_frame(
            b"####REQ_ID_42########H_NAME####:method####H_VALUE####GET####REQ_END####",
        )
        .unwrap();
        assert_eq!(frame.request_id, 42);
        assert_eq!(frame.headers.len(), 1);
        assert_eq!(frame.headers[0].0.as_ref(), b":method");
        assert_eq!(frame.headers[0].1.as_ref(), b"GET");
        assert!(frame.body.is_none());
    }

    #[test]
    fn parses_frame_with_multiple_headers_and_no_closing_marker_on_values() {
        let frame = parse_echo_frame(
            b"####REQ_ID_9########H_NAME####:method####H_VALUE####GET####H_NAME####host####H_VALUE####example.com####REQ_END####",
        )
        .unwrap();
        assert_eq!(frame.headers.len(), 2);
        assert_eq!(frame.headers[0].1.as_ref(), b"GET");
        assert_eq!(frame.headers[1].1.as_ref(), b"example.com");
    }

    #[test]
    fn parses_frame_with_body() {
        let frame = parse_echo_frame(b"####REQ_ID_7########BODY####payload####REQ_END####").unwrap();
        assert_eq!(frame.request_id, 7);
        assert_eq!(frame.body.as_deref(), Some(b"payload".as_slice()));
    }

    #[test]
    fn rejects_frame_missing_prefix() {
        assert!(parse_echo_frame(b"not a frame").is_err());
    }

    #[test]
    fn none_sentinel_id_is_rejected() {
        assert!(parse_echo_frame(b"####REQ_ID_None####").is_err());
    }
}
