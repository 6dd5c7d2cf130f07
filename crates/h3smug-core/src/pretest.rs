//! Pre-Test Engine: runs the grammar's declared probes plus an implicit
//! per-char static sweep, classifies each, then rewrites the grammar via
//! `Grammar::apply_pre_test_actions`.

use std::path::Path;

use bytes::Bytes;
use rand::Rng;

use crate::builder::{self, BuildParams};
use crate::classifier;
use crate::error::Result;
use crate::grammar::Grammar;
use crate::model::{IllegalIn, MaliciousLoad, Request, Slot};
use crate::transport::Transport;

/// Run every declared pre-test and the implicit per-char static sweep, then
/// apply the accumulated influence to the grammar.
///
/// Declared probes run after the implicit sweep, matching the reference
/// implementation's static-test queue ordering (implicit per-char probes
/// first, then the declared probe set).
pub async fn run(
    grammar: &mut Grammar,
    transport: &mut dyn Transport,
    params: &BuildParams<'_>,
    echo_path: &Path,
    rng: &mut impl Rng,
) -> Result<()> {
    run_implicit_probes(grammar, transport, params, echo_path).await?;

    let sequences: Vec<(usize, Vec<String>)> =
        grammar.pre_tests().iter().enumerate().map(|(i, pt)| (i, pt.sequence.clone())).collect();
    for (index, sequence) in sequences {
        let (request, _illegal) = builder::build_request(grammar, &sequence, params, rng)?;
        let response = send(transport, &request).await?;
        let outcome = classifier::classify(grammar, &request, response.as_ref(), echo_path).await?;
        grammar.pre_tests_mut()[index].result = Some(outcome);
    }

    grammar.apply_pre_test_actions()
}

async fn send(
    transport: &mut dyn Transport,
    request: &Request,
) -> Result<Option<crate::transport::Response>> {
    Ok(transport.send(request.headers.clone(), request.body.clone()).await?)
}

/// One implicit static probe per (char-table, character) pair whose table
/// has `illegal-in` set: the dummy header `b"malformed"` with that single
/// character inserted, wrapped in the four mandatory pseudo-headers.
async fn run_implicit_probes(
    grammar: &mut Grammar,
    transport: &mut dyn Transport,
    params: &BuildParams<'_>,
    echo_path: &Path,
) -> Result<()> {
    let table_names: Vec<String> = grammar
        .char_tables()
        .iter()
        .filter(|(_, table)| table.illegal_in.is_some())
        .map(|(name, _)| name.clone())
        .collect();

    for table_name in table_names {
        let mut index = 0;
        loop {
            let Some((bytes, slot, illegal_in)) = grammar.char_tables().get(&table_name).and_then(|table| {
                table.entry(index).map(|e| (e.bytes.clone(), e.slot, table.illegal_in))
            }) else {
                break;
            };

            let request = build_implicit_probe(&table_name, &bytes, slot, illegal_in, params);
            let response = send(transport, &request).await?;
            let outcome = classifier::classify(grammar, &request, response.as_ref(), echo_path).await?;
            // An ACCEPTED outcome drops the entry from the table, shifting
            // the next entry into the current index; only advance when the
            // entry survived.
            if outcome != crate::model::Outcome::Accepted {
                index += 1;
            }
        }
    }
    Ok(())
}

fn build_implicit_probe(
    table_name: &str,
    bytes: &Bytes,
    slot: Slot,
    illegal_in: Option<IllegalIn>,
    params: &BuildParams<'_>,
) -> Request {
    let mutated = splice_at_slot(b"malformed".to_vec(), bytes, slot);

    let mut headers = vec![
        (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
        (Bytes::from_static(b":scheme"), Bytes::from_static(b"https")),
        (Bytes::from_static(b":authority"), Bytes::copy_from_slice(params.authority)),
        (Bytes::from_static(b":path"), Bytes::copy_from_slice(params.path)),
    ];
    match illegal_in {
        Some(IllegalIn::HeaderName) => headers.push((Bytes::from(mutated), Bytes::from_static(b"probe"))),
        _ => headers.push((Bytes::from_static(b"x-h3smug-probe"), Bytes::from(mutated))),
    }

    let id = builder::next_request_id();
    let mut malicious = MaliciousLoad::default();
    malicious.push_all(bytes.clone());
    malicious.push_char(table_name.to_string(), (bytes.clone(), slot));
    headers.push((Bytes::from_static(b"smuggling-id"), Bytes::from(id.to_string().into_bytes())));

    Request { id, headers, body: None, malicious }
}

fn splice_at_slot(base: Vec<u8>, bytes: &Bytes, slot: Slot) -> Vec<u8> {
    let mut buf = base;
    let offset = match slot {
        Slot::Prefix => 0,
        Slot::Postfix => buf.len(),
        Slot::Infix => {
            if buf.len() > 2 {
                buf.len() / 2
            } else {
                buf.len()
            }
        }
    };
    buf.splice(offset..offset, bytes.iter().copied());
    buf
}
