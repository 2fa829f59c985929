//! Prepared statement integration tests

use crate::{get_proxy_config, skip_if_not_enabled};
use mysql::prelude::*;

#[test]
fn prepare_execute_close() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let stmt = conn
        .prep("SELECT ? + ?")
        .expect("PREPARE should succeed through the proxy");

    let sum: Option<i64> = conn
        .exec_first(&stmt, (1, 2))
        .expect("EXECUTE should succeed");
    assert_eq!(sum, Some(3));

    // Re-execution reuses the statement id translation
    let sum: Option<i64> = conn
        .exec_first(&stmt, (40, 2))
        .expect("second EXECUTE should succeed");
    assert_eq!(sum, Some(42));

    conn.close(stmt).expect("CLOSE should succeed");
}

#[test]
fn many_statements_keep_distinct_ids() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    let add = conn.prep("SELECT ? + 1").expect("PREPARE should succeed");
    let double = conn.prep("SELECT ? * 2").expect("PREPARE should succeed");

    let a: Option<i64> = conn.exec_first(&add, (10,)).expect("EXECUTE should succeed");
    let d: Option<i64> = conn
        .exec_first(&double, (10,))
        .expect("EXECUTE should succeed");

    assert_eq!(a, Some(11));
    assert_eq!(d, Some(20));

    conn.close(add).expect("CLOSE should succeed");
    conn.close(double).expect("CLOSE should succeed");
}

#[test]
fn text_protocol_prepare() {
    skip_if_not_enabled!();

    let config = get_proxy_config();
    let mut conn = config.conn();

    conn.query_drop("PREPARE text_stmt FROM 'SELECT 7'")
        .expect("text PREPARE should succeed");

    let value: Option<i64> = conn
        .query_first("EXECUTE text_stmt")
        .expect("text EXECUTE should succeed");
    assert_eq!(value, Some(7));

    conn.query_drop("DEALLOCATE PREPARE text_stmt")
        .expect("DEALLOCATE should succeed");
}
