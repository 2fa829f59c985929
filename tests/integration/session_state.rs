//! Session state integration tests: schema switches, autocommit and
//! temporary tables must behave as if the client talked to one server.

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

#[test]
fn schema_switch_is_tracked() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop(format!("USE {}", config.database))
        .expect("USE should succeed");

    let db: Option<String> = conn
        .query_first("SELECT DATABASE()")
        .expect("SELECT DATABASE() should succeed");
    assert_eq!(db.as_deref(), Some(config.database.as_str()));
}

#[test]
fn autocommit_toggle_reaches_every_backend() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("SET autocommit=0")
        .expect("SET autocommit should succeed");

    let value: Option<u8> = conn
        .query_first("SELECT @@autocommit")
        .expect("SELECT @@autocommit should succeed");
    assert_eq!(value, Some(0));

    conn.query_drop("SET autocommit=1")
        .expect("SET autocommit should succeed");
}

#[test]
fn temporary_tables_stay_visible() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("CREATE TEMPORARY TABLE tmp_state (v INT)")
        .expect("CREATE TEMPORARY TABLE should succeed");
    conn.query_drop("INSERT INTO tmp_state VALUES (5)")
        .expect("INSERT should succeed");

    // A read of a temporary table must reach the server holding it, even
    // though it looks like a plain replica-eligible SELECT
    for _ in 0..5 {
        let v: Option<i64> = conn
            .query_first("SELECT v FROM tmp_state")
            .expect("SELECT from the temporary table should succeed");
        assert_eq!(v, Some(5));
    }

    conn.query_drop("DROP TABLE tmp_state")
        .expect("DROP TABLE should succeed");
}

#[test]
fn user_variables_are_consistent() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("SET @probe = 17")
        .expect("SET @probe should succeed");

    // With use_sql_variables_in=all the variable exists on every backend
    for _ in 0..5 {
        let v: Option<i64> = conn
            .query_first("SELECT @probe")
            .expect("SELECT @probe should succeed");
        assert_eq!(v, Some(17));
    }
}
