//! Readiness protocol integration tests.
//!
//! Each test simulates the primary store the FHIR server writes and checks
//! how the handler classifies and applies index messages against it.

mod common;

use std::time::Duration;

use common::*;
use helios_remote_index::IndexError;
use helios_remote_index::handler::{HandlerOptions, WaitTimeoutPolicy};

// ============================================================================
// Classification scenarios
// ============================================================================

#[test]
fn test_matching_version_is_applied() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 3, "abc").build();
    idx.commit_version(&message);

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![message]).unwrap();

    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.stale, 0);
    assert_eq!(outcome.dropped, 0);
    assert_eq!(outcome.transactions, 1);
    assert_eq!(outcome.rows, 2);
    assert_eq!(idx.string_values(42), vec!["Doe".to_string()]);
    assert_eq!(idx.rows_for("resource_token_refs", 42), 1);
}

#[test]
fn test_lagging_primary_store_waits_then_drops() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 3, "abc").build();
    idx.set_version("Patient", "p42", 42, 2, "old", at(2));

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![message]).unwrap();

    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.dropped, 1);
    assert!(outcome.transactions >= 2);
    assert_eq!(idx.rows_for("str_values", 42), 0);
}

#[test]
fn test_missing_snapshot_waits() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(7, 1, "abc").build();

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![message]).unwrap();

    assert_eq!(outcome.dropped, 1);
    assert_eq!(idx.row_count("str_values"), 0);
}

#[test]
fn test_superseded_version_is_stale() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 3, "abc").build();
    idx.set_version("Patient", "p42", 42, 4, "newer", at(4));

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![message]).unwrap();

    assert_eq!(outcome.stale, 1);
    assert_eq!(outcome.applied, 0);
    assert_eq!(outcome.transactions, 1);
    assert_eq!(idx.rows_for("str_values", 42), 0);
}

#[test]
fn test_reused_version_with_different_hash_is_stale() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 3, "abc").build();
    idx.set_version("Patient", "p42", 42, 3, "xyz", message.last_updated);

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![message]).unwrap();

    assert_eq!(outcome.stale, 1);
    assert_eq!(idx.rows_for("str_values", 42), 0);
}

#[test]
fn test_reused_version_with_different_timestamp_is_stale() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 3, "abc").build();
    idx.set_version("Patient", "p42", 42, 3, "abc", at(999));

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![message]).unwrap();

    assert_eq!(outcome.stale, 1);
}

#[test]
fn test_sub_second_timestamps_compare_exactly() {
    let idx = TestIndex::new();
    let last_updated = at(0) + chrono::Duration::microseconds(123_456);
    let message = PatientMessage::new(42, 3, "abc")
        .with_last_updated(last_updated)
        .build();
    idx.commit_version(&message);

    let mut handler = idx.handler(handler_options());
    assert_eq!(handler.process_messages(vec![message]).unwrap().applied, 1);
}

// ============================================================================
// Redelivery
// ============================================================================

#[test]
fn test_stale_message_stays_stale() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 3, "abc").build();
    idx.set_version("Patient", "p42", 42, 4, "newer", at(4));

    let mut handler = idx.handler(handler_options());
    for _ in 0..3 {
        let outcome = handler.process_messages(vec![message.clone()]).unwrap();
        assert_eq!(outcome.stale, 1);
        assert_eq!(outcome.applied, 0);
    }
    assert_eq!(idx.rows_for("str_values", 42), 0);
}

#[test]
fn test_redelivered_message_does_not_duplicate_rows() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 3, "abc")
        .with_tag("http://example.org/tags", "vip")
        .build();
    idx.commit_version(&message);

    let mut handler = idx.handler(handler_options());
    handler.process_messages(vec![message.clone()]).unwrap();
    let parameter_names = idx.row_count("parameter_names");
    let token_values = idx.row_count("common_token_values");

    let outcome = handler.process_messages(vec![message]).unwrap();
    assert_eq!(outcome.applied, 1);
    assert_eq!(idx.rows_for("str_values", 42), 1);
    assert_eq!(idx.rows_for("resource_token_refs", 42), 1);
    assert_eq!(idx.rows_for("tags", 42), 1);
    assert_eq!(idx.row_count("parameter_names"), parameter_names);
    assert_eq!(idx.row_count("common_token_values"), token_values);
}

#[test]
fn test_new_version_replaces_rows() {
    let idx = TestIndex::new();
    let mut handler = idx.handler(handler_options());

    let first = PatientMessage::new(42, 1, "h1").build();
    idx.commit_version(&first);
    handler.process_messages(vec![first]).unwrap();

    let second = PatientMessage::new(42, 2, "h2").with_family("Roe").build();
    idx.commit_version(&second);
    handler.process_messages(vec![second]).unwrap();

    assert_eq!(idx.string_values(42), vec!["Roe".to_string()]);
}

#[test]
fn test_batch_keeps_latest_version_per_resource() {
    let idx = TestIndex::new();
    let older = PatientMessage::new(42, 2, "h2").with_family("Old").build();
    let newer = PatientMessage::new(42, 3, "h3").with_family("New").build();
    idx.commit_version(&newer);

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![newer, older]).unwrap();

    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.stale, 1);
    assert_eq!(idx.string_values(42), vec!["New".to_string()]);
}

// ============================================================================
// Wait bound
// ============================================================================

#[test]
fn test_message_applied_once_primary_store_catches_up() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 3, "abc").build();
    idx.set_version("Patient", "p42", 42, 2, "old", at(2));

    let options = HandlerOptions {
        max_ready_wait: Duration::from_secs(5),
        ready_retry_interval: Duration::from_millis(20),
        ..handler_options()
    };
    let mut handler = idx.handler(options);

    let outcome = std::thread::scope(|scope| {
        scope.spawn(|| {
            std::thread::sleep(Duration::from_millis(100));
            idx.commit_version(&message);
        });
        handler.process_messages(vec![message.clone()]).unwrap()
    });

    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.dropped, 0);
    assert!(outcome.transactions >= 2);
    assert_eq!(idx.rows_for("str_values", 42), 1);
}

#[test]
fn test_fail_policy_returns_wait_timeout() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 3, "abc").build();
    idx.set_version("Patient", "p42", 42, 2, "old", at(2));

    let options = HandlerOptions {
        wait_timeout_policy: WaitTimeoutPolicy::Fail,
        ..handler_options()
    };
    let mut handler = idx.handler(options);

    match handler.process_messages(vec![message]) {
        Err(IndexError::WaitTimeout { waiting, waited }) => {
            assert_eq!(waiting, 1);
            assert!(waited >= Duration::from_millis(200));
        }
        other => panic!("expected wait timeout, got {:?}", other),
    }
}

#[test]
fn test_ready_messages_applied_while_others_wait() {
    let idx = TestIndex::new();
    let ready = PatientMessage::new(1, 1, "a").build();
    let waiting = PatientMessage::new(2, 1, "b").build();
    idx.commit_version(&ready);

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![ready, waiting]).unwrap();

    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.dropped, 1);
    assert_eq!(idx.rows_for("str_values", 1), 1);
}

// ============================================================================
// Decoding and filtering
// ============================================================================

#[test]
fn test_undecodable_and_unsupported_payloads_rejected() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 3, "abc").build();
    idx.commit_version(&message);

    let good = envelope(message.clone(), None);
    let future = good.replace("\"messageVersion\":1", "\"messageVersion\":2");
    assert_ne!(good, future);

    let mut handler = idx.handler(handler_options());
    let outcome = handler
        .handle(&["{not json".to_string(), future, good])
        .unwrap();

    assert_eq!(outcome.received, 3);
    assert_eq!(outcome.rejected, 2);
    assert_eq!(outcome.applied, 1);
}

#[test]
fn test_other_instance_messages_ignored() {
    let idx = TestIndex::new();
    let mine = PatientMessage::new(1, 1, "a").build();
    let theirs = PatientMessage::new(2, 1, "b").build();
    idx.commit_version(&mine);
    idx.commit_version(&theirs);

    let options = HandlerOptions {
        instance_identifier: Some("fhir-1".to_string()),
        ..handler_options()
    };
    let mut handler = idx.handler(options);
    let outcome = handler
        .handle(&[
            envelope(mine, Some("fhir-1")),
            envelope(theirs, Some("fhir-2")),
        ])
        .unwrap();

    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.ignored, 1);
    assert_eq!(idx.rows_for("str_values", 2), 0);
}

#[test]
fn test_unknown_resource_type_rejected() {
    let idx = TestIndex::new();
    let mut unknown = PatientMessage::new(5, 1, "a").build();
    unknown.resource_type = "Unicorn".to_string();
    let mut unsafe_name = PatientMessage::new(6, 1, "a").build();
    unsafe_name.resource_type = "Patient; DROP TABLE str_values".to_string();

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![unknown, unsafe_name]).unwrap();

    assert_eq!(outcome.rejected, 2);
    assert_eq!(outcome.transactions, 0);
}

#[test]
fn test_unapplicable_message_rejected_without_blocking_batch() {
    let idx = TestIndex::new();
    idx.drop_table("Observation_logical_resources");
    let good = PatientMessage::new(1, 1, "a").build();
    idx.commit_version(&good);
    let mut broken = PatientMessage::new(2, 1, "b").build();
    broken.resource_type = "Observation".to_string();
    broken.logical_id = "o2".to_string();

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![broken, good]).unwrap();

    assert_eq!(outcome.applied, 1);
    assert_eq!(outcome.rejected, 1);
    assert_eq!(idx.rows_for("str_values", 1), 1);
    assert_eq!(idx.rows_for("str_values", 2), 0);

    let retry = PatientMessage::new(1, 1, "a").build();
    assert_eq!(handler.process_messages(vec![retry]).unwrap().applied, 1);
}

// ============================================================================
// Parameter types
// ============================================================================

#[test]
fn test_reference_to_missing_target_creates_ident() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 1, "a")
        .with_reference("general-practitioner", "Practitioner", "dr-1")
        .build();
    idx.commit_version(&message);
    let idents = idx.row_count("logical_resource_ident");

    let mut handler = idx.handler(handler_options());
    handler.process_messages(vec![message]).unwrap();

    assert_eq!(idx.rows_for("ref_values", 42), 1);
    assert_eq!(idx.row_count("logical_resource_ident"), idents + 1);
}

#[test]
fn test_reference_to_existing_target_reuses_id() {
    let idx = TestIndex::new();
    idx.set_version("Organization", "org-1", 500, 1, "o", at(1));
    let message = PatientMessage::new(42, 1, "a")
        .with_reference("organization", "Organization", "org-1")
        .build();
    idx.commit_version(&message);

    let mut handler = idx.handler(handler_options());
    handler.process_messages(vec![message]).unwrap();

    let conn = idx.database.connection().unwrap();
    let target: i64 = conn
        .query_row(
            "SELECT ref_logical_resource_id FROM ref_values WHERE logical_resource_id = 42",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(target, 500);
}

#[test]
fn test_reference_to_unknown_type_skipped() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 1, "a")
        .with_reference("link", "Unicorn", "u-1")
        .build();
    idx.commit_version(&message);

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![message]).unwrap();

    assert_eq!(outcome.applied, 1);
    assert_eq!(idx.rows_for("ref_values", 42), 0);
    assert_eq!(idx.rows_for("str_values", 42), 1);
}

#[test]
fn test_tags_profiles_and_dates() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 1, "a")
        .with_tag("http://example.org/tags", "vip")
        .with_profile("http://example.org/StructureDefinition/my-patient")
        .with_birth_date(at(0))
        .build();
    idx.commit_version(&message);

    let mut handler = idx.handler(handler_options());
    let outcome = handler.process_messages(vec![message]).unwrap();

    assert_eq!(outcome.rows, 5);
    assert_eq!(idx.rows_for("tags", 42), 1);
    assert_eq!(idx.rows_for("profiles", 42), 1);
    assert_eq!(idx.rows_for("date_values", 42), 1);
    assert_eq!(idx.row_count("common_canonical_values"), 1);
}

#[test]
fn test_token_without_system_uses_default_system() {
    let idx = TestIndex::new();
    let message = PatientMessage::new(42, 1, "a")
        .with_token("identifier", None, "12345")
        .build();
    idx.commit_version(&message);

    let mut handler = idx.handler(handler_options());
    handler.process_messages(vec![message]).unwrap();

    let conn = idx.database.connection().unwrap();
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM common_token_values AS c
               JOIN code_systems AS s ON s.code_system_id = c.code_system_id
              WHERE s.code_system_name = 'default-token-system' AND c.token_value = '12345'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(count, 1);
}
