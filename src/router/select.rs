use tracing::{debug, warn};

use crate::classifier::{Classification, TypeMask};
use crate::protocol::Command;
use crate::session::SessionState;

use super::{RouteTarget, UseSqlVariablesIn};

/// Routing hint attached to a command by an upstream component
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hint {
    /// Hard override: the statement must run on the primary
    RouteToPrimary,
    RouteToReplica,
    RouteToNamedServer(String),
    RouteToLastUsed,
    /// Only replicas lagging at most this many seconds qualify
    MaxReplicationLag(u32),
}

/// Pick the route target for one classified command.
///
/// Pure with respect to its inputs; prepared-statement continuations bypass
/// this function entirely and reuse the previous statement target.
pub fn select(
    classification: &Classification,
    session: &SessionState,
    hints: &[Hint],
    use_sql_variables_in: UseSqlVariablesIn,
) -> RouteTarget {
    let mask = classification.type_mask;
    let command = classification.command;

    let mut target;

    if command == Command::StmtClose
        || command == Command::StmtReset
        || mask.intersects(TypeMask::PREPARE_STMT | TypeMask::PREPARE_NAMED_STMT)
    {
        // Statement preparation and bookkeeping go to every backend so any
        // of them can execute the statement later
        target = RouteTarget::ALL;
    } else if mask.intersects(
        TypeMask::SESSION_WRITE
            | TypeMask::GSYSVAR_WRITE
            | TypeMask::ENABLE_AUTOCOMMIT
            | TypeMask::DISABLE_AUTOCOMMIT,
    ) || (use_sql_variables_in == UseSqlVariablesIn::All
        && mask.intersects(TypeMask::USERVAR_WRITE))
    {
        target = RouteTarget::ALL;

        if mask.intersects(TypeMask::READ) {
            // A SELECT cannot be broadcast: only one result set can reach
            // the client
            warn!(
                "statement mixes a SELECT with session variable changes, \
                 routing to the primary only"
            );
            target = RouteTarget::PRIMARY;
        }
    } else if session.locked_to_primary {
        target = RouteTarget::PRIMARY;
    } else if !session.is_trx_active()
        && !session.is_load_data_active()
        && mask.is_read_only(use_sql_variables_in)
    {
        target = RouteTarget::REPLICA;
    } else if session.is_trx_declared_read_only() {
        // READ ONLY transactions run on a replica for their whole lifetime
        target = RouteTarget::REPLICA;
    } else {
        target = RouteTarget::PRIMARY;
    }

    for hint in hints {
        match hint {
            Hint::RouteToPrimary => {
                // Hard override, remaining hints are irrelevant
                debug!("hint: route to primary");
                target = RouteTarget::PRIMARY;
                return target;
            }
            Hint::RouteToReplica => {
                debug!("hint: route to replica");
                target = RouteTarget::REPLICA;
            }
            Hint::RouteToNamedServer(name) => {
                debug!(server = %name, "hint: route to named server");
                target |= RouteTarget::NAMED_SERVER;
            }
            Hint::RouteToLastUsed => {
                debug!("hint: route to last used");
                target = RouteTarget::LAST_USED;
            }
            Hint::MaxReplicationLag(_) => {
                target |= RouteTarget::RLAG_MAX;
            }
        }
    }

    if target.contains(RouteTarget::REPLICA) && command == Command::Query {
        let found_rows = classification
            .function_names
            .iter()
            .any(|f| f.eq_ignore_ascii_case("FOUND_ROWS"));
        if found_rows {
            // FOUND_ROWS must see the server that produced the previous
            // result
            target = RouteTarget::LAST_USED;
        }
    }

    target
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{Classifier, Operation};
    use bytes::Bytes;

    fn classify(sql: &str) -> Classification {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        Classifier::new()
            .classify(&Bytes::from(payload), true)
            .unwrap()
    }

    fn select_for(sql: &str, session: &SessionState) -> RouteTarget {
        select(&classify(sql), session, &[], UseSqlVariablesIn::All)
    }

    #[test]
    fn read_outside_transaction_goes_to_replica() {
        let session = SessionState::new();
        assert_eq!(select_for("SELECT 1", &session), RouteTarget::REPLICA);
    }

    #[test]
    fn write_goes_to_primary() {
        let session = SessionState::new();
        assert_eq!(
            select_for("INSERT INTO t VALUES (1)", &session),
            RouteTarget::PRIMARY
        );
    }

    #[test]
    fn transaction_stickiness() {
        // BEGIN, then SELECT: both on the primary; SELECT after COMMIT on a
        // replica
        let mut session = SessionState::new();

        let begin = classify("BEGIN");
        assert_eq!(
            select(&begin, &session, &[], UseSqlVariablesIn::All),
            RouteTarget::PRIMARY
        );
        session.observe_classification(&begin);

        assert_eq!(
            select_for("SELECT * FROM t", &session),
            RouteTarget::PRIMARY
        );

        let commit = classify("COMMIT");
        assert_eq!(
            select(&commit, &session, &[], UseSqlVariablesIn::All),
            RouteTarget::PRIMARY
        );
        session.observe_classification(&commit);
        session.command_complete();

        assert_eq!(select_for("SELECT 1", &session), RouteTarget::REPLICA);
    }

    #[test]
    fn read_only_transaction_stays_on_replica() {
        let mut session = SessionState::new();

        let begin = classify("START TRANSACTION READ ONLY");
        assert_eq!(
            select(&begin, &session, &[], UseSqlVariablesIn::All),
            RouteTarget::REPLICA
        );
        session.observe_classification(&begin);

        assert_eq!(select_for("SELECT 1", &session), RouteTarget::REPLICA);
        assert_eq!(select_for("SELECT 2", &session), RouteTarget::REPLICA);

        let commit = classify("COMMIT");
        assert_eq!(
            select(&commit, &session, &[], UseSqlVariablesIn::All),
            RouteTarget::REPLICA
        );
    }

    #[test]
    fn session_writes_are_broadcast() {
        let session = SessionState::new();
        assert_eq!(
            select_for("SET NAMES utf8mb4", &session),
            RouteTarget::ALL
        );
        assert_eq!(select_for("SET autocommit=0", &session), RouteTarget::ALL);
    }

    #[test]
    fn select_with_variable_write_falls_back_to_primary() {
        let session = SessionState::new();
        assert_eq!(
            select_for("SELECT @x := 1 FROM t", &session),
            RouteTarget::PRIMARY
        );
    }

    #[test]
    fn prepare_is_broadcast() {
        let session = SessionState::new();
        let mut payload = vec![0x16];
        payload.extend_from_slice(b"SELECT ?");
        let c = Classifier::new()
            .classify(&Bytes::from(payload), true)
            .unwrap();
        assert_eq!(
            select(&c, &session, &[], UseSqlVariablesIn::All),
            RouteTarget::ALL
        );
    }

    #[test]
    fn stmt_close_is_broadcast() {
        let session = SessionState::new();
        let c = Classifier::new()
            .classify(&Bytes::from(vec![0x19u8, 1, 0, 0, 0]), true)
            .unwrap();
        assert_eq!(
            select(&c, &session, &[], UseSqlVariablesIn::All),
            RouteTarget::ALL
        );
    }

    #[test]
    fn locked_session_pins_reads_to_primary() {
        let mut session = SessionState::new();
        let call = classify("CALL p()");
        assert_eq!(call.operation, Operation::Call);
        session.observe_classification(&call);
        assert!(session.locked_to_primary);

        assert_eq!(select_for("SELECT 1", &session), RouteTarget::PRIMARY);
    }

    #[test]
    fn primary_hint_overrides_everything() {
        let session = SessionState::new();
        let target = select(
            &classify("SELECT 1"),
            &session,
            &[Hint::RouteToPrimary, Hint::RouteToNamedServer("s1".into())],
            UseSqlVariablesIn::All,
        );
        assert_eq!(target, RouteTarget::PRIMARY);
    }

    #[test]
    fn named_server_hint_is_additive() {
        let session = SessionState::new();
        let target = select(
            &classify("SELECT 1"),
            &session,
            &[Hint::RouteToNamedServer("s1".into())],
            UseSqlVariablesIn::All,
        );
        assert!(target.contains(RouteTarget::REPLICA));
        assert!(target.contains(RouteTarget::NAMED_SERVER));
    }

    #[test]
    fn replication_lag_hint_is_a_modifier() {
        let session = SessionState::new();
        let target = select(
            &classify("SELECT 1"),
            &session,
            &[Hint::MaxReplicationLag(5)],
            UseSqlVariablesIn::All,
        );
        assert!(target.contains(RouteTarget::REPLICA));
        assert!(target.contains(RouteTarget::RLAG_MAX));
    }

    #[test]
    fn found_rows_goes_to_last_used() {
        let session = SessionState::new();
        assert_eq!(
            select_for("SELECT FOUND_ROWS()", &session),
            RouteTarget::LAST_USED
        );
    }

    #[test]
    fn uservar_write_still_broadcasts_through_session_write() {
        // SET @x carries SESSION_WRITE too, so the variable-handling config
        // does not change the broadcast decision for SET statements
        let session = SessionState::new();
        let target = select(
            &classify("SET @x = 1"),
            &session,
            &[],
            UseSqlVariablesIn::Primary,
        );
        assert_eq!(target, RouteTarget::ALL);
    }
}
