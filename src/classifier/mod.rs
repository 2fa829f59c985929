//! Query classification: derives a routing type mask, referenced tables and
//! prepared-statement references from one client command packet.

mod sql;
mod type_mask;

pub use sql::{detect_multi_statement, SqlAnalysis, SqlAnalyzer};
pub use type_mask::TypeMask;

use bytes::Bytes;

use crate::protocol::{Command, ProtocolError, PS_ID_OFFSET};

/// Detected statement operation, where the route selector needs more than
/// the type mask alone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    #[default]
    None,
    /// Text-protocol EXECUTE of a named prepared statement
    Execute,
    /// Stored procedure CALL
    Call,
    DropTable,
    /// DEALLOCATE PREPARE
    Deallocate,
}

/// Classification of one client command packet
#[derive(Debug, Clone)]
pub struct Classification {
    pub command: Command,
    pub type_mask: TypeMask,
    pub operation: Operation,
    pub tables: Vec<String>,
    pub ps_name: Option<String>,
    pub function_names: Vec<String>,
    /// The payload contains more than one statement
    pub multi_statement: bool,
}

/// Classifier for client command packets.
///
/// Command-code lookup decides most commands outright; COM_QUERY and
/// COM_STMT_PREPARE payloads go through the SQL analyzer.
pub struct Classifier {
    analyzer: SqlAnalyzer,
}

impl Classifier {
    pub fn new() -> Self {
        Self {
            analyzer: SqlAnalyzer::new(),
        }
    }

    /// Classify one command packet payload (first byte is the command code).
    pub fn classify(
        &self,
        payload: &Bytes,
        multi_statements_allowed: bool,
    ) -> Result<Classification, ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::EmptyPayload);
        }

        let command = Command::from(payload[0]);

        let mut classification = Classification {
            command,
            type_mask: TypeMask::UNKNOWN,
            operation: Operation::None,
            tables: vec![],
            ps_name: None,
            function_names: vec![],
            multi_statement: false,
        };

        match command {
            Command::Quit
            | Command::InitDb
            | Command::Refresh
            | Command::Debug
            | Command::Ping
            | Command::ChangeUser
            | Command::SetOption
            | Command::ResetConnection => {
                classification.type_mask = TypeMask::SESSION_WRITE;
            }

            Command::CreateDb
            | Command::DropDb
            | Command::StmtClose
            | Command::StmtSendLongData
            | Command::StmtReset => {
                classification.type_mask = TypeMask::WRITE;
            }

            Command::FieldList => {
                classification.type_mask = TypeMask::READ;
            }

            Command::StmtExecute | Command::StmtBulkExecute => {
                // No parsing: the mask comes from the prepared statement
                classification.type_mask = TypeMask::EXEC_STMT;
            }

            Command::Query => {
                let sql = String::from_utf8_lossy(&payload[1..]);
                let analysis = self.analyzer.analyze(&sql);
                classification.type_mask = analysis.type_mask;
                classification.operation = analysis.operation;
                classification.tables = analysis.tables;
                classification.ps_name = analysis.ps_name;
                classification.function_names = analysis.function_names;
                classification.multi_statement =
                    multi_statements_allowed && detect_multi_statement(&sql);
            }

            Command::StmtPrepare => {
                let sql = String::from_utf8_lossy(&payload[1..]);
                let analysis = self.analyzer.analyze(&sql);
                classification.type_mask = analysis.type_mask | TypeMask::PREPARE_STMT;
                classification.tables = analysis.tables;
            }

            _ => {}
        }

        Ok(classification)
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Commands that carry a statement id at the fixed payload offset
pub fn is_ps_command(cmd: Command) -> bool {
    matches!(
        cmd,
        Command::StmtExecute
            | Command::StmtBulkExecute
            | Command::StmtSendLongData
            | Command::StmtClose
            | Command::StmtFetch
            | Command::StmtReset
    )
}

/// The 4-byte little-endian statement id of a COM_STMT_* payload
pub fn extract_ps_id(payload: &[u8]) -> Result<u32, ProtocolError> {
    if payload.len() < PS_ID_OFFSET + 4 {
        return Err(ProtocolError::Truncated);
    }
    let bytes = [
        payload[PS_ID_OFFSET],
        payload[PS_ID_OFFSET + 1],
        payload[PS_ID_OFFSET + 2],
        payload[PS_ID_OFFSET + 3],
    ];
    Ok(u32::from_le_bytes(bytes))
}

/// Parameter count of a STMT_PREPARE_OK payload (u16 LE at offset 7)
pub fn extract_ps_param_count(payload: &[u8]) -> Result<u16, ProtocolError> {
    if payload.len() < 9 {
        return Err(ProtocolError::Truncated);
    }
    Ok(u16::from_le_bytes([payload[7], payload[8]]))
}

/// Continuation rule: follow-up commands of the same prepared statement must
/// go to the backend that handled the previous step.
///
/// - STMT_SEND_LONG_DATA followed by STMT_EXECUTE or more SEND_LONG_DATA
/// - STMT_FETCH always follows its STMT_EXECUTE
/// - A STMT_EXECUTE whose new-params-bound flag is 0 relies on the parameter
///   types of a previous execute
pub fn query_continues_ps(prev_cmd: Command, cmd: Command, param_count: u16, payload: &[u8]) -> bool {
    if prev_cmd == Command::StmtSendLongData
        && (cmd == Command::StmtExecute || cmd == Command::StmtSendLongData)
    {
        return true;
    }

    if cmd == Command::StmtFetch {
        return true;
    }

    if cmd == Command::StmtExecute && param_count > 0 {
        // Payload layout: cmd(1) + id(4) + flags(1) + iterations(4)
        //                 + null bitmap + new-params-bound flag
        let offset = 1 + 4 + 1 + 4 + (param_count as usize + 7) / 8;
        if let Some(&new_params_bound) = payload.get(offset) {
            return new_params_bound == 0;
        }
    }

    false
}
