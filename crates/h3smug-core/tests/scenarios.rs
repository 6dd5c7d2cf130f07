//! End-to-end scenario fixtures exercising the grammar, mutation, and
//! classifier subsystems together, the way a single fuzz iteration does.

use bytes::Bytes;
use h3smug_core::builder::{self, BuildParams};
use h3smug_core::classifier;
use h3smug_core::grammar::Grammar;
use h3smug_core::model::{Outcome, Slot};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde_json::json;

fn params<'a>(authority: &'a [u8], path: &'a [u8]) -> BuildParams<'a> {
    BuildParams { authority, path, max_name_chars: 64, max_value_chars: 64, is_static: false }
}

/// Scenario 1: a non-terminal with two uniform derivations, one dropped by
/// an `ACCEPTED` pre-test outcome — the surviving derivation's probability
/// becomes 1.0.
#[test]
fn pre_test_drop_renormalizes_surviving_derivation_to_one() {
    let document = json!({
        "nonterminals": {
            "root": {
                "derivations": [["h"], ["h"]],
                "probabilities": [0.5, 0.5]
            }
        },
        "headers": {
            "h": {
                "name": { "literals": ["x-probe"], "probabilities": [1.0] },
                "value": { "literals": ["v"], "probabilities": [1.0] }
            }
        },
        "pre-tests": {
            "pt": {
                "sequence": ["h"],
                "influence": {
                    "if-accepted": { "drop": [["root", 0]] }
                }
            }
        }
    });
    let mut grammar = Grammar::from_value(&document).unwrap();
    grammar.pre_tests_mut()[0].result = Some(Outcome::Accepted);
    grammar.apply_pre_test_actions().unwrap();

    let mut rng = StdRng::seed_from_u64(1);
    let remaining = grammar.sample_derivation("root", &mut rng).unwrap();
    assert_eq!(remaining, Some(vec!["h".to_string()]));
}

/// Scenario 3: `InsertChar "0x20" postfix quantity=2` on `"abc"` yields
/// `"abc  "`, with the two inserted spaces tracked as malicious load.
#[test]
fn insert_char_postfix_quantity_two_pads_with_spaces() {
    use h3smug_core::model::{CharTable, IllegalIn};
    use h3smug_core::mutation::Mutation;
    use std::collections::HashMap;

    let table = CharTable::new(vec![(Bytes::from_static(b" "), Slot::Postfix)], Some(IllegalIn::HeaderValue));
    let mut tables = HashMap::new();
    tables.insert("spaces".to_string(), table);

    let mutation = Mutation::InsertChar {
        table: "spaces".to_string(),
        position: h3smug_core::model::Position::Postfix,
        quantity: 2,
    };
    let mut rng = StdRng::seed_from_u64(7);
    let (out, load) = mutation.apply(Bytes::from_static(b"abc"), None, &tables, &mut rng);
    assert_eq!(out.as_ref(), b"abc  ");
    assert!(load.chars.iter().any(|(name, (bytes, slot))| name == "spaces" && bytes.as_ref() == b" " && *slot == Slot::Postfix));
    assert_eq!(load.all.len(), 2, "both inserted spaces must be tracked in `all`, not deduplicated away");
    assert!(load.all.iter().all(|b| b.as_ref() == b" "));
}

/// Scenario 4: `ReplaceWithUppercase quantity=1` on `"foo"` produces one of
/// the three single-character-uppercased variants under a seeded RNG.
#[test]
fn replace_with_uppercase_flips_exactly_one_lowercase_byte() {
    use h3smug_core::mutation::Mutation;
    use std::collections::HashMap;

    let tables = HashMap::new();
    let mutation = Mutation::ReplaceWithUppercase { quantity: 1 };
    let mut rng = StdRng::seed_from_u64(3);
    let (out, _load) = mutation.apply(Bytes::from_static(b"foo"), None, &tables, &mut rng);
    let candidates: [&[u8]; 3] = [b"Foo", b"fOo", b"foO"];
    assert!(candidates.contains(&out.as_ref()));
}

/// Scenario 6: a full pipeline run where the origin echoes the mutated
/// `:method` verbatim — outcome is `ACCEPTED` and the offending char-table
/// entry is dropped.
#[tokio::test]
async fn full_pipeline_accepted_drops_char_table_entry() {
    let document = json!({
        "headers": {
            "method": {
                "name": { "literals": [":method"], "probabilities": [1.0] },
                "value": {
                    "literals": ["GET"],
                    "probabilities": [1.0],
                    "mutations": [["insert_cr"]]
                }
            }
        },
        "char-tables": {
            "cr-table": {
                "illegal-in": "header-value",
                "chars": ["0x0D"]
            }
        },
        "mutations": {
            "insert_cr": { "type": "InsertChar", "table": "cr-table", "position": "infix", "quantity": 1 }
        }
    });
    let mut grammar = Grammar::from_value(&document).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let echo_path = dir.path().join("request");

    let build_params = params(b"example.com", b"/");
    let mut rng = StdRng::seed_from_u64(11);
    let (request, _illegal) =
        builder::build_request(&grammar, &["method".to_string()], &build_params, &mut rng).unwrap();

    let value = &request.headers.iter().find(|(n, _)| n.as_ref() == b":method").unwrap().1;
    assert!(value.contains(&0x0Du8), "mutated method should contain the inserted CR byte");

    let echo_frame = origin_echo::EchoRequest {
        smuggling_id: request.id.to_string().into_bytes(),
        headers: vec![(b":method".to_vec(), value.to_vec())],
        body: Vec::new(),
    };
    tokio::fs::write(&echo_path, origin_echo::build_frame_bytes(&echo_frame)).await.unwrap();

    let outcome = classifier::classify(&mut grammar, &request, None, &echo_path).await.unwrap();
    assert_eq!(outcome, Outcome::Accepted);

    let table = grammar.char_tables().get("cr-table").unwrap();
    assert_eq!(table.len(), 0, "the accepted entry should have been dropped from the table");
}

/// Regression test for a parser bug: a header value runs directly up to the
/// next `####H_NAME####`/`####BODY####`/`####REQ_END####` marker with no
/// closing `####` of its own (only the id has one). Feeds the real
/// `origin_echo::build_frame_bytes` writer output straight into
/// `classifier::read_echo_file`, rather than a hand-built literal, so a
/// mismatch between what the origin writes and what the classifier expects
/// shows up here.
#[tokio::test]
async fn classifier_reads_back_the_real_writers_frame_format() {
    let dir = tempfile::tempdir().unwrap();
    let echo_path = dir.path().join("request");

    let raw_request = b"GET /foo HTTP/1.1\r\nHost: example.com\r\nsmuggling-id: 99\r\n\r\n";
    let parsed = origin_echo::parse_request(raw_request);
    tokio::fs::write(&echo_path, origin_echo::build_frame_bytes(&parsed)).await.unwrap();

    let frame = classifier::read_echo_file(&echo_path, 99).await.unwrap().expect("frame must parse and match id 99");
    assert_eq!(frame.request_id, 99);
    assert!(frame.headers.iter().any(|(n, v)| n.as_ref() == b"Host" && v.as_ref() == b"example.com"));
    assert!(frame.headers.iter().any(|(n, v)| n.as_ref() == b"req-pth" && v.as_ref() == b"/foo"));
    assert!(frame.body.is_none());
}
