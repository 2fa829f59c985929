use sqlparser::ast::{
    Expr, Function, FunctionArg, FunctionArgExpr, ObjectType, Query, SelectItem, SetExpr,
    Statement, TableFactor, TableWithJoins,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use tracing::debug;

use super::type_mask::TypeMask;
use super::Operation;

/// Result of analyzing one SQL string
#[derive(Debug, Clone, Default)]
pub struct SqlAnalysis {
    pub type_mask: TypeMask,
    pub operation: Operation,
    /// Tables referenced by the statement, as written (possibly qualified)
    pub tables: Vec<String>,
    /// Name of a text-protocol prepared statement (PREPARE/EXECUTE/DEALLOCATE)
    pub ps_name: Option<String>,
    /// Function names invoked by a SELECT
    pub function_names: Vec<String>,
}

/// SQL analyzer deriving routing type masks from statements.
///
/// Transaction control, SET and the text prepared-statement verbs are
/// recognized with keyword fast-paths; everything else goes through the
/// MySQL-dialect parser. Statements the parser cannot handle classify as
/// UNKNOWN, which the route selector sends to the primary.
pub struct SqlAnalyzer {
    dialect: MySqlDialect,
}

impl SqlAnalyzer {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    pub fn analyze(&self, sql: &str) -> SqlAnalysis {
        let trimmed = sql.trim().trim_end_matches(';').trim_end();

        if let Some(analysis) = self.fast_path(trimmed) {
            return self.with_variable_scan(trimmed, analysis);
        }

        let mut analysis = match Parser::parse_sql(&self.dialect, trimmed) {
            Ok(statements) => match statements.first() {
                Some(stmt) => self.analyze_statement(stmt),
                None => SqlAnalysis::default(),
            },
            Err(e) => {
                debug!(error = %e, "statement not parseable, classifying as unknown");
                SqlAnalysis::default()
            }
        };

        analysis = self.with_variable_scan(trimmed, analysis);
        analysis
    }

    /// Keyword dispatch for statements that must not depend on the parser
    fn fast_path(&self, sql: &str) -> Option<SqlAnalysis> {
        let upper = sql.to_uppercase();

        let mut analysis = SqlAnalysis::default();

        if upper == "BEGIN" || upper == "BEGIN WORK" || upper.starts_with("BEGIN;") {
            analysis.type_mask = TypeMask::BEGIN_TRX;
        } else if upper.starts_with("START TRANSACTION") {
            analysis.type_mask = TypeMask::BEGIN_TRX;
            if upper.contains("READ ONLY") {
                analysis.type_mask |= TypeMask::READ;
            } else if upper.contains("READ WRITE") {
                analysis.type_mask |= TypeMask::WRITE;
            }
        } else if upper.starts_with("COMMIT") {
            analysis.type_mask = TypeMask::COMMIT;
        } else if upper.starts_with("ROLLBACK") {
            analysis.type_mask = TypeMask::ROLLBACK;
        } else if upper.starts_with("SET ") || upper == "SET" {
            analysis.type_mask = set_statement_mask(&upper);
        } else if upper.starts_with("USE ") {
            analysis.type_mask = TypeMask::SESSION_WRITE;
        } else if upper.starts_with("SHOW DATABASES") || upper.starts_with("SHOW SCHEMAS") {
            analysis.type_mask = TypeMask::SHOW_DATABASES;
        } else if upper.starts_with("SHOW TABLES") || upper.starts_with("SHOW FULL TABLES") {
            analysis.type_mask = TypeMask::SHOW_TABLES;
        } else if upper.starts_with("SHOW ") {
            analysis.type_mask = TypeMask::READ;
        } else if upper.starts_with("PREPARE ") {
            analysis.type_mask = self.named_prepare_mask(sql) | TypeMask::PREPARE_NAMED_STMT;
            analysis.ps_name = second_word(sql);
        } else if upper.starts_with("EXECUTE ") {
            analysis.type_mask = TypeMask::EXEC_STMT;
            analysis.operation = Operation::Execute;
            analysis.ps_name = second_word(sql);
        } else if upper.starts_with("DEALLOCATE PREPARE ") || upper.starts_with("DROP PREPARE ") {
            analysis.type_mask = TypeMask::WRITE;
            analysis.operation = Operation::Deallocate;
            analysis.ps_name = sql.split_whitespace().nth(2).map(unquote_ident);
        } else if upper.starts_with("CALL ") {
            analysis.type_mask = TypeMask::WRITE;
            analysis.operation = Operation::Call;
        } else if upper.starts_with("LOAD DATA") {
            analysis.type_mask = TypeMask::WRITE;
        } else if upper.starts_with("DESCRIBE ")
            || upper.starts_with("DESC ")
            || upper.starts_with("EXPLAIN ")
        {
            analysis.type_mask = TypeMask::READ;
        } else {
            return None;
        }

        Some(analysis)
    }

    /// Mask of the statement inside `PREPARE name FROM '...'`
    fn named_prepare_mask(&self, sql: &str) -> TypeMask {
        let Some(from_pos) = find_keyword(sql, "FROM") else {
            return TypeMask::UNKNOWN;
        };
        let body = sql[from_pos + 4..].trim();
        let inner = body
            .strip_prefix('\'')
            .and_then(|s| s.strip_suffix('\''))
            .or_else(|| body.strip_prefix('"').and_then(|s| s.strip_suffix('"')));

        match inner {
            Some(inner) => self.analyze(inner).type_mask,
            None => TypeMask::UNKNOWN,
        }
    }

    fn analyze_statement(&self, stmt: &Statement) -> SqlAnalysis {
        let mut analysis = SqlAnalysis::default();

        match stmt {
            Statement::Query(query) => self.analyze_query(query, &mut analysis),
            Statement::Insert { table_name, .. } => {
                analysis.type_mask = TypeMask::WRITE;
                analysis.tables.push(table_name.to_string());
            }
            Statement::Update { table, .. } => {
                analysis.type_mask = TypeMask::WRITE;
                analysis.tables.extend(tables_of(table));
            }
            Statement::Delete { from, .. } => {
                analysis.type_mask = TypeMask::WRITE;
                for t in from {
                    analysis.tables.extend(tables_of(t));
                }
            }
            Statement::CreateTable {
                temporary, name, ..
            } => {
                analysis.type_mask = TypeMask::WRITE;
                if *temporary {
                    analysis.type_mask |= TypeMask::CREATE_TMP_TABLE;
                }
                analysis.tables.push(name.to_string());
            }
            Statement::Drop {
                object_type, names, ..
            } => {
                analysis.type_mask = TypeMask::WRITE;
                if *object_type == ObjectType::Table {
                    analysis.operation = Operation::DropTable;
                    analysis.tables.extend(names.iter().map(|n| n.to_string()));
                }
            }
            Statement::Truncate { table_name, .. } => {
                analysis.type_mask = TypeMask::WRITE;
                analysis.tables.push(table_name.to_string());
            }
            // DDL and administrative statements belong on the primary
            _ => analysis.type_mask = TypeMask::WRITE,
        }

        analysis
    }

    fn analyze_query(&self, query: &Query, analysis: &mut SqlAnalysis) {
        analysis.type_mask |= TypeMask::READ;

        // SELECT ... FOR UPDATE / LOCK IN SHARE MODE takes row locks
        if !query.locks.is_empty() {
            analysis.type_mask |= TypeMask::WRITE;
        }

        self.analyze_set_expr(&query.body, analysis);

        for name in &analysis.function_names {
            if name.eq_ignore_ascii_case("LAST_INSERT_ID") {
                analysis.type_mask |= TypeMask::MASTER_READ;
            }
        }
    }

    fn analyze_set_expr(&self, body: &SetExpr, analysis: &mut SqlAnalysis) {
        match body {
            SetExpr::Select(select) => {
                for table_with_joins in &select.from {
                    analysis.tables.extend(tables_of(table_with_joins));
                }
                for item in &select.projection {
                    match item {
                        SelectItem::UnnamedExpr(expr)
                        | SelectItem::ExprWithAlias { expr, .. } => {
                            collect_functions(expr, &mut analysis.function_names);
                        }
                        _ => {}
                    }
                }
                if let Some(selection) = &select.selection {
                    collect_functions(selection, &mut analysis.function_names);
                }
            }
            SetExpr::Query(inner) => self.analyze_set_expr(&inner.body, analysis),
            SetExpr::SetOperation { left, right, .. } => {
                self.analyze_set_expr(left, analysis);
                self.analyze_set_expr(right, analysis);
            }
            _ => {}
        }
    }

    /// Add user/system variable bits found by scanning the raw text. The
    /// parser does not represent `@v` and `@@v` uniformly across statement
    /// shapes, so this is done on the bytes, skipping strings and comments.
    fn with_variable_scan(&self, sql: &str, mut analysis: SqlAnalysis) -> SqlAnalysis {
        // SET handles its own variable semantics
        let upper_start = sql.trim_start().get(..4).map(str::to_uppercase);
        if upper_start.as_deref() == Some("SET ") {
            return analysis;
        }

        analysis.type_mask |= scan_variables(sql);
        analysis
    }
}

impl Default for SqlAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify a SET statement (input already uppercased)
fn set_statement_mask(upper: &str) -> TypeMask {
    let rest = upper["SET".len()..].trim_start();

    if let Some(eq) = rest.find("AUTOCOMMIT") {
        let value = rest[eq + "AUTOCOMMIT".len()..]
            .trim_start()
            .trim_start_matches('=')
            .trim_start();
        let enable = value.starts_with('1') || value.starts_with("ON") || value.starts_with("TRUE");
        let mask = if enable {
            TypeMask::ENABLE_AUTOCOMMIT
        } else {
            TypeMask::DISABLE_AUTOCOMMIT
        };
        return TypeMask::SESSION_WRITE | mask;
    }

    if rest.starts_with("GLOBAL ") || rest.contains("@@GLOBAL.") {
        return TypeMask::GSYSVAR_WRITE;
    }

    if rest.starts_with('@') && !rest.starts_with("@@") {
        return TypeMask::USERVAR_WRITE | TypeMask::SESSION_WRITE;
    }

    TypeMask::SESSION_WRITE
}

/// Scan for `@uservar` and `@@sysvar` references outside strings, backtick
/// identifiers and comments.
fn scan_variables(sql: &str) -> TypeMask {
    let bytes = sql.as_bytes();
    let mut mask = TypeMask::UNKNOWN;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i),
            b'#' => i = skip_line_comment(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_line_comment(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b'@' => {
                if bytes.get(i + 1) == Some(&b'@') {
                    let name_start = i + 2;
                    let upper_rest = sql[name_start..].to_uppercase();
                    if upper_rest.starts_with("GLOBAL.") {
                        mask |= TypeMask::GSYSVAR_READ;
                    } else {
                        mask |= TypeMask::SYSVAR_READ;
                    }
                    i = name_start;
                } else {
                    // User variable: `@x := ...` is a write, `@x` a read
                    let mut j = i + 1;
                    while j < bytes.len() && is_ident_byte(bytes[j]) {
                        j += 1;
                    }
                    let mut k = j;
                    while k < bytes.len() && bytes[k].is_ascii_whitespace() {
                        k += 1;
                    }
                    if bytes.get(k) == Some(&b':') && bytes.get(k + 1) == Some(&b'=') {
                        mask |= TypeMask::USERVAR_WRITE;
                    } else {
                        mask |= TypeMask::USERVAR_READ;
                    }
                    i = j;
                }
            }
            _ => i += 1,
        }
    }

    mask
}

/// Detect a second statement after an unescaped, unquoted `;`. A trailing
/// semicolon followed only by whitespace does not count. Stored program
/// bodies (CREATE PROCEDURE and friends) contain semicolons that are not
/// statement separators.
pub fn detect_multi_statement(sql: &str) -> bool {
    if is_stored_program(sql) {
        return false;
    }

    let bytes = sql.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' | b'"' | b'`' => i = skip_quoted(bytes, i),
            b'#' => i = skip_line_comment(bytes, i),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_line_comment(bytes, i),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_block_comment(bytes, i),
            b';' => {
                return bytes[i + 1..].iter().any(|b| !b.is_ascii_whitespace());
            }
            _ => i += 1,
        }
    }

    false
}

fn is_stored_program(sql: &str) -> bool {
    let upper = sql.trim_start().to_uppercase();
    if !upper.starts_with("CREATE") {
        return false;
    }
    ["PROCEDURE", "FUNCTION", "TRIGGER", "EVENT"]
        .iter()
        .any(|kw| find_keyword(&upper, kw).is_some())
}

fn skip_quoted(bytes: &[u8], start: usize) -> usize {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == b'\\' && quote != b'`' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            // Doubled quote is an escaped quote
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    i
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && bytes[i] != b'\n' {
        i += 1;
    }
    i
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 2;
    while i + 1 < bytes.len() {
        if bytes[i] == b'*' && bytes[i + 1] == b'/' {
            return i + 2;
        }
        i += 1;
    }
    bytes.len()
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'$'
}

/// Position of a standalone keyword (case matching the haystack)
fn find_keyword(haystack: &str, keyword: &str) -> Option<usize> {
    let upper = haystack.to_uppercase();
    let mut from = 0;
    while let Some(pos) = upper[from..].find(keyword) {
        let abs = from + pos;
        let before_ok = abs == 0
            || !upper.as_bytes()[abs - 1].is_ascii_alphanumeric()
                && upper.as_bytes()[abs - 1] != b'_';
        let after = abs + keyword.len();
        let after_ok = after >= upper.len()
            || !upper.as_bytes()[after].is_ascii_alphanumeric() && upper.as_bytes()[after] != b'_';
        if before_ok && after_ok {
            return Some(abs);
        }
        from = abs + keyword.len();
    }
    None
}

fn second_word(sql: &str) -> Option<String> {
    sql.split_whitespace().nth(1).map(unquote_ident)
}

fn unquote_ident(word: &str) -> String {
    word.trim_end_matches(';')
        .trim_matches('`')
        .to_string()
}

fn tables_of(table_with_joins: &TableWithJoins) -> Vec<String> {
    let mut tables = vec![];

    if let TableFactor::Table { name, .. } = &table_with_joins.relation {
        tables.push(name.to_string());
    }

    for join in &table_with_joins.joins {
        if let TableFactor::Table { name, .. } = &join.relation {
            tables.push(name.to_string());
        }
    }

    tables
}

fn collect_functions(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Function(Function { name, args, .. }) => {
            out.push(name.to_string());
            for arg in args {
                let inner = match arg {
                    FunctionArg::Named { arg, .. } => arg,
                    FunctionArg::Unnamed(arg) => arg,
                };
                if let FunctionArgExpr::Expr(e) = inner {
                    collect_functions(e, out);
                }
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_functions(left, out);
            collect_functions(right, out);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => collect_functions(expr, out),
        Expr::InList { expr, list, .. } => {
            collect_functions(expr, out);
            for e in list {
                collect_functions(e, out);
            }
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            collect_functions(expr, out);
            collect_functions(low, out);
            collect_functions(high, out);
        }
        Expr::Cast { expr, .. } => collect_functions(expr, out),
        _ => {}
    }
}
