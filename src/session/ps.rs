use std::collections::HashMap;

use tracing::warn;

use crate::classifier::TypeMask;

/// External id meaning "the most recently prepared statement"
pub const PS_ID_LATEST: u32 = 0xFFFF_FFFF;

/// A binary-protocol prepared statement known to the session
#[derive(Debug, Clone, Default)]
pub struct PreparedStatement {
    pub param_count: u16,
    pub type_mask: TypeMask,
}

/// Registry of the session's prepared statements.
///
/// Binary statements are keyed by a session-internal id handed out at
/// prepare time; the client-visible id maps back to it through
/// `ext_to_int`. Text statements (`PREPARE name FROM ...`) only need their
/// type mask for routing.
#[derive(Debug, Default)]
pub struct PsRegistry {
    binary: HashMap<u32, PreparedStatement>,
    text: HashMap<String, TypeMask>,
    ext_to_int: HashMap<u32, u32>,
    prev_ps_id: u32,
    next_internal: u32,
}

impl PsRegistry {
    pub fn new() -> Self {
        Self {
            next_internal: 1,
            ..Default::default()
        }
    }

    /// Register a binary prepared statement at prepare time, returning its
    /// session-internal id. The parameter count arrives later with the
    /// server's response.
    pub fn store(&mut self, type_mask: TypeMask) -> u32 {
        let id = self.next_internal;
        self.next_internal += 1;
        self.binary.insert(
            id,
            PreparedStatement {
                param_count: 0,
                type_mask,
            },
        );
        id
    }

    /// Record the server's STMT_PREPARE response for an internal id
    pub fn store_response(&mut self, internal_id: u32, param_count: u16) {
        self.prev_ps_id = internal_id;
        self.ext_to_int.insert(internal_id, internal_id);
        if let Some(ps) = self.binary.get_mut(&internal_id) {
            ps.param_count = param_count;
        }
    }

    /// Resolve a client-supplied external id to the internal id.
    /// `0xFFFFFFFF` means the most recently prepared statement.
    pub fn resolve(&self, external_id: u32) -> Option<u32> {
        let external_id = if external_id == PS_ID_LATEST {
            self.prev_ps_id
        } else {
            external_id
        };

        match self.ext_to_int.get(&external_id) {
            Some(&internal) => Some(internal),
            None => {
                warn!(
                    external_id,
                    "client refers to an unknown prepared statement id"
                );
                None
            }
        }
    }

    pub fn type_of(&self, internal_id: u32) -> TypeMask {
        match self.binary.get(&internal_id) {
            Some(ps) => ps.type_mask,
            None => {
                warn!(internal_id, "using unknown prepared statement");
                TypeMask::UNKNOWN
            }
        }
    }

    pub fn param_count(&self, internal_id: u32) -> u16 {
        self.binary
            .get(&internal_id)
            .map(|ps| ps.param_count)
            .unwrap_or(0)
    }

    pub fn erase(&mut self, internal_id: u32) {
        if self.binary.remove(&internal_id).is_none() {
            warn!(internal_id, "closing unknown prepared statement");
        }
        self.ext_to_int.retain(|_, v| *v != internal_id);
    }

    pub fn store_text(&mut self, name: &str, type_mask: TypeMask) {
        self.text.insert(name.to_string(), type_mask);
    }

    pub fn type_of_text(&self, name: &str) -> TypeMask {
        match self.text.get(name) {
            Some(&mask) => mask,
            None => {
                warn!(name, "using unknown text prepared statement");
                TypeMask::UNKNOWN
            }
        }
    }

    pub fn erase_text(&mut self, name: &str) {
        if self.text.remove(name).is_none() {
            warn!(name, "deallocating unknown text prepared statement");
        }
    }

    pub fn prev_ps_id(&self) -> u32 {
        self.prev_ps_id
    }

    /// Number of registered binary statements
    pub fn len(&self) -> usize {
        self.binary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.binary.is_empty()
    }
}
