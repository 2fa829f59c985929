use std::collections::HashSet;

use tracing::{debug, info};

use crate::classifier::{Classification, Operation, TypeMask};
use crate::protocol::{status::*, Command, OkPacket, StateChange};
use crate::router::UseSqlVariablesIn;

use super::ps::PsRegistry;

/// LOAD DATA LOCAL INFILE relay progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadDataState {
    #[default]
    Inactive,
    /// Client data packets are being relayed to the backend
    Active,
    /// Empty terminator seen, waiting for the final OK
    End,
}

/// Client-scoped routing state.
///
/// Mutated from two directions: classifier output for each client command,
/// and observed server responses (OK packets with session tracking).
#[derive(Debug, Default)]
pub struct SessionState {
    /// Client username
    pub username: String,
    /// Current database
    pub database: Option<String>,
    /// Client capability flags
    pub capability_flags: u32,
    /// Character set
    pub character_set: u8,

    pub autocommit: bool,
    pub trx_active: bool,
    /// COMMIT/ROLLBACK observed, transaction ends when its reply completes
    pub trx_ending: bool,
    /// True from transaction start until the first non-read-only statement
    /// inside it; never flips back within one transaction
    pub trx_read_only: bool,
    /// The transaction was opened with START TRANSACTION READ ONLY
    trx_declared_read_only: bool,

    /// Once true, every statement of the session runs on the primary
    pub locked_to_primary: bool,
    pub multi_statements_allowed: bool,

    tmp_tables: HashSet<String>,
    pub ps: PsRegistry,

    pub load_data: LoadDataState,
    pub load_data_sent: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            autocommit: true,
            trx_read_only: true,
            ps: PsRegistry::new(),
            ..Default::default()
        }
    }

    /// Update state after parsing the client handshake response
    pub fn set_from_handshake(
        &mut self,
        username: String,
        database: Option<String>,
        capabilities: u32,
        charset: u8,
        multi_statements_allowed: bool,
    ) {
        self.username = username;
        self.database = database;
        self.capability_flags = capabilities;
        self.character_set = charset;
        self.multi_statements_allowed = multi_statements_allowed;
    }

    pub fn current_db(&self) -> &str {
        self.database.as_deref().unwrap_or("")
    }

    pub fn is_autocommit(&self) -> bool {
        self.autocommit
    }

    pub fn is_trx_active(&self) -> bool {
        self.trx_active
    }

    pub fn is_trx_ending(&self) -> bool {
        self.trx_ending
    }

    pub fn is_trx_read_only(&self) -> bool {
        self.trx_read_only
    }

    /// True while an explicitly READ ONLY transaction is active or ending
    pub fn is_trx_declared_read_only(&self) -> bool {
        self.trx_declared_read_only
    }

    pub fn is_load_data_active(&self) -> bool {
        self.load_data != LoadDataState::Inactive
    }

    pub fn client_capabilities(&self) -> u32 {
        self.capability_flags
    }

    /// Apply one classified client command to the session state. Returns the
    /// effective type mask, which may extend the classifier's (reads of
    /// temporary tables become primary-bound reads).
    pub fn observe_classification(&mut self, classification: &Classification) -> TypeMask {
        let mut mask = classification.type_mask;

        // Multi-statement queries and stored procedure calls can change
        // state the classifier cannot see; the session stays on the primary
        // from here on.
        if !self.locked_to_primary
            && (classification.multi_statement || classification.operation == Operation::Call)
        {
            info!("multi-statement or CALL seen, locking session to the primary");
            self.locked_to_primary = true;
        }

        if classification.command == Command::Query {
            self.track_tmp_tables(classification, &mut mask);
        }

        // trx_read_only transitions: reset at transaction boundaries, latch
        // to false on the first non-read-only statement inside one
        if self.trx_ending || mask.contains(TypeMask::BEGIN_TRX) {
            self.trx_read_only = true;
        } else if self.trx_active && !mask.is_read_only(UseSqlVariablesIn::All) {
            self.trx_read_only = false;
        }

        if mask.contains(TypeMask::BEGIN_TRX) {
            self.trx_active = true;
            self.trx_ending = false;
            self.trx_declared_read_only = mask.contains(TypeMask::READ);
        }

        if mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK) {
            self.trx_ending = true;
        }

        if mask.contains(TypeMask::ENABLE_AUTOCOMMIT) {
            self.autocommit = true;
            if self.trx_active {
                self.trx_ending = true;
            }
        } else if mask.contains(TypeMask::DISABLE_AUTOCOMMIT) {
            self.autocommit = false;
        }

        mask
    }

    /// Complete the current command: transaction-ending statements take
    /// effect once their reply has been received.
    pub fn command_complete(&mut self) {
        if self.trx_ending {
            self.trx_active = false;
            self.trx_ending = false;
            self.trx_read_only = true;
            self.trx_declared_read_only = false;
        }
    }

    /// Apply an observed server OK packet: status flags and session-state
    /// tracking information.
    pub fn observe_ok(&mut self, ok: &OkPacket) {
        self.autocommit = ok.status_flags & SERVER_STATUS_AUTOCOMMIT != 0;

        let in_trans = ok.status_flags & SERVER_STATUS_IN_TRANS != 0;
        if self.trx_active != in_trans {
            debug!(in_trans, "server transaction state differs, following server");
            self.trx_active = in_trans;
            if !in_trans {
                self.trx_ending = false;
                self.trx_read_only = true;
                self.trx_declared_read_only = false;
            }
        }

        for change in &ok.state_changes {
            match change {
                StateChange::Schema(schema) => {
                    debug!(schema = %schema, "session track: schema change");
                    self.database = Some(schema.clone());
                }
                StateChange::SystemVariable { name, value } => {
                    if name.eq_ignore_ascii_case("autocommit") {
                        self.autocommit = value.eq_ignore_ascii_case("ON") || value == "1";
                    }
                }
                StateChange::TransactionState(state) => {
                    // Eight-character state string, e.g. "T_______": explicit
                    // or implicit transaction open
                    let active = state.starts_with('T') || state.starts_with('I');
                    self.trx_active = active;
                    if !active {
                        self.trx_ending = false;
                        self.trx_declared_read_only = false;
                    }
                }
                StateChange::TransactionCharacteristics(chars) => {
                    if chars.to_uppercase().contains("READ ONLY") {
                        self.trx_declared_read_only = true;
                    }
                }
                _ => {}
            }
        }
    }

    /// Record the database after a successful COM_INIT_DB or USE
    pub fn change_database(&mut self, db: String) {
        self.database = Some(db);
    }

    pub fn has_tmp_tables(&self) -> bool {
        !self.tmp_tables.is_empty()
    }

    fn track_tmp_tables(&mut self, classification: &Classification, mask: &mut TypeMask) {
        if classification.operation == Operation::DropTable {
            for table in &classification.tables {
                let qualified = self.qualify(table);
                if self.tmp_tables.remove(&qualified) {
                    debug!(table = %qualified, "temporary table dropped");
                }
            }
        }

        // A read touching a known temporary table must see the server that
        // holds it
        if self.has_tmp_tables()
            && mask.intersects(
                TypeMask::READ
                    | TypeMask::USERVAR_READ
                    | TypeMask::SYSVAR_READ
                    | TypeMask::GSYSVAR_READ,
            )
        {
            for table in &classification.tables {
                if self.tmp_tables.contains(&self.qualify(table)) {
                    debug!(table = %table, "query reads a temporary table");
                    *mask |= TypeMask::READ_TMP_TABLE | TypeMask::MASTER_READ;
                    break;
                }
            }
        }

        if mask.contains(TypeMask::CREATE_TMP_TABLE) {
            if let Some(table) = classification.tables.first() {
                let qualified = self.qualify(table);
                info!(table = %qualified, "temporary table created");
                self.tmp_tables.insert(qualified);
            }
        }
    }

    /// Qualify an unqualified table name with the current database
    fn qualify(&self, table: &str) -> String {
        if table.contains('.') {
            table.to_string()
        } else {
            format!("{}.{}", self.current_db(), table)
        }
    }
}
