//! Property-based test generators using proptest.
//!
//! Provides strategies for records, dirty states and id sets that keep the
//! invariants the engine relies on: server ids never look local and every
//! generated record carries an object type.

use mobilesync_protocol::record::{ID, LAST_MODIFIED_DATE};
use mobilesync_protocol::{create_local_id, timestamp, DirtyState, Record};
use proptest::prelude::*;
use std::collections::BTreeSet;

/// Strategy for server record ids.
pub fn server_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("001[A-Za-z0-9]{12}").expect("Invalid regex")
}

/// Strategy for field values: short names with quotes and backslashes.
pub fn field_value_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Za-z0-9 '\\\\]{0,24}").expect("Invalid regex")
}

/// Strategy for any combination of local flags.
pub fn dirty_state_strategy() -> impl Strategy<Value = DirtyState> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(created, updated, deleted)| {
        DirtyState {
            created,
            updated,
            deleted,
        }
    })
}

/// Strategy for modification dates within 2024.
pub fn modification_date_strategy() -> impl Strategy<Value = String> {
    (0i64..31_536_000_000).prop_map(|offset| {
        timestamp::format_millis(1_704_067_200_000 + offset).expect("Timestamp in range")
    })
}

/// Strategy for `Account` records with any dirty state.
///
/// Locally created records get a local id, the others a server id.
pub fn account_strategy() -> impl Strategy<Value = Record> {
    (
        server_id_strategy(),
        field_value_strategy(),
        modification_date_strategy(),
        dirty_state_strategy(),
    )
        .prop_map(|(server_id, name, modified, state)| {
            let id = if state.created {
                create_local_id()
            } else {
                server_id
            };
            Record::new()
                .with_object_type("Account")
                .with(ID, id)
                .with("Name", name)
                .with(LAST_MODIFIED_DATE, modified)
                .with_dirty_state(state)
        })
}

/// Strategy for a pair of id sets, local then remote, drawn from one pool
/// so they overlap.
pub fn id_sets_strategy() -> impl Strategy<Value = (BTreeSet<String>, BTreeSet<String>)> {
    prop::collection::vec(server_id_strategy(), 0..30).prop_flat_map(|pool| {
        let len = pool.len();
        (
            prop::collection::vec(any::<bool>(), len),
            prop::collection::vec(any::<bool>(), len),
        )
            .prop_map(move |(in_local, in_remote)| {
                let pick = |mask: &[bool]| -> BTreeSet<String> {
                    pool.iter()
                        .zip(mask)
                        .filter(|(_, keep)| **keep)
                        .map(|(id, _)| id.clone())
                        .collect()
                };
                (pick(&in_local), pick(&in_remote))
            })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mobilesync_protocol::is_local_id;

    proptest! {
        #[test]
        fn server_ids_never_look_local(id in server_id_strategy()) {
            prop_assert!(!is_local_id(&id));
        }

        #[test]
        fn accounts_keep_their_state(record in account_strategy()) {
            let state = record.dirty_state();
            prop_assert_eq!(record.is_dirty(), state.is_dirty());
            prop_assert_eq!(is_local_id(record.id(ID).unwrap()), state.created);
            prop_assert_eq!(record.object_type(), Some("Account"));
        }

        #[test]
        fn id_sets_come_from_one_pool((local, remote) in id_sets_strategy()) {
            prop_assert!(local.iter().chain(remote.iter()).all(|id| id.starts_with("001")));
        }
    }
}
