//! Token/window registry (component B): allocation, registration, and
//! teardown of per-object RMA windows, including slave tokens for inner
//! allocatable components.
//!
//! Tokens are stable integer handles into an append-only-with-tombstones
//! table, never raw pointers (design note, spec.md §9): the top bit of
//! the handle selects the master or slave table, the rest is an index.

use parking_lot::RwLock;

use crate::descriptor::Descriptor;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::transport::{DynAddr, ImageId, LockMode, RmaTransport, WindowId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Data,
    Lock,
    Event,
    Critical,
    Atomic,
}

impl TokenKind {
    /// Lock/event/critical/atomic tokens are sized in `sizeof(i32)` units,
    /// per spec.md §4.B.
    fn window_bytes(self, size: usize) -> usize {
        match self {
            TokenKind::Data => size,
            TokenKind::Lock | TokenKind::Event | TokenKind::Critical | TokenKind::Atomic => {
                size * std::mem::size_of::<i32>()
            }
        }
    }

    fn zero_initialize(self) -> bool {
        !matches!(self, TokenKind::Data)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeregisterMode {
    /// Release memory and window/backing storage, drop the record.
    Full,
    /// Release memory but keep the token alive for later reallocation
    /// (spec.md §4.B).
    DeallocateOnly,
}

/// Stable handle identifying one registered object. Callers never inspect
/// it (spec.md §6 Token ABI).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Token(u64);

const SLAVE_BIT: u64 = 1 << 63;

impl Token {
    fn master(idx: usize) -> Self {
        Token(idx as u64)
    }

    fn slave(idx: usize) -> Self {
        Token(idx as u64 | SLAVE_BIT)
    }

    fn is_slave(self) -> bool {
        self.0 & SLAVE_BIT != 0
    }

    fn index(self) -> usize {
        (self.0 & !SLAVE_BIT) as usize
    }
}

pub struct MasterToken {
    pub window: WindowId,
    pub size: usize,
    pub kind: TokenKind,
    pub descriptor: Option<Descriptor>,
    live: bool,
}

pub struct SlaveToken {
    pub addr: Option<DynAddr>,
    pub size: usize,
    pub descriptor: Option<Descriptor>,
    live: bool,
}

/// Owns the two linked lists (here: tombstoned vectors) of runtime-owned
/// tokens, for ordered teardown at finalize (spec.md §3).
pub struct TokenRegistry {
    masters: RwLock<Vec<MasterToken>>,
    slaves: RwLock<Vec<SlaveToken>>,
}

impl Default for TokenRegistry {
    fn default() -> Self {
        TokenRegistry { masters: RwLock::new(Vec::new()), slaves: RwLock::new(Vec::new()) }
    }
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_master(
        &self,
        transport: &dyn RmaTransport,
        size: usize,
        kind: TokenKind,
        descriptor: Option<Descriptor>,
    ) -> CoreResult<Token> {
        let bytes = kind.window_bytes(size);
        let window = transport.create_window(bytes).map_err(|e| {
            CoreError::new(ErrorKind::AllocationFailure, format!("window allocation failed: {e}"))
        })?;
        if kind.zero_initialize() {
            let zeros = vec![0u8; bytes];
            transport.lock(window, transport.this_image(), LockMode::Exclusive)?;
            transport.put(window, transport.this_image(), 0, &zeros)?;
            transport.unlock(window, transport.this_image())?;
        }
        let record = MasterToken { window, size, kind, descriptor, live: true };
        let mut masters = self.masters.write();
        let idx = masters.len();
        masters.push(record);
        Ok(Token::master(idx))
    }

    pub fn register_slave(
        &self,
        transport: &dyn RmaTransport,
        size: usize,
        descriptor: Option<Descriptor>,
    ) -> CoreResult<Token> {
        let addr = transport.attach_dynamic(vec![0u8; size]).map_err(|e| {
            CoreError::new(ErrorKind::AllocationFailure, format!("dynamic attach failed: {e}"))
        })?;
        let record = SlaveToken { addr: Some(addr), size, descriptor, live: true };
        let mut slaves = self.slaves.write();
        let idx = slaves.len();
        slaves.push(record);
        Ok(Token::slave(idx))
    }

    pub fn lookup_master(&self, token: Token) -> CoreResult<(WindowId, Option<Descriptor>)> {
        if token.is_slave() {
            return Err(CoreError::new(ErrorKind::InvalidReference, "token is not a master token"));
        }
        let masters = self.masters.read();
        let rec = masters
            .get(token.index())
            .filter(|r| r.live)
            .ok_or_else(|| CoreError::new(ErrorKind::InvalidReference, "unknown or freed master token"))?;
        Ok((rec.window, rec.descriptor.clone()))
    }

    /// Slot count a master token was registered with (e.g. one `i32` per
    /// image for lock/event/atomic tokens), used for offset bounds
    /// checks.
    pub fn master_slot_count(&self, token: Token) -> CoreResult<usize> {
        if token.is_slave() {
            return Err(CoreError::new(ErrorKind::InvalidReference, "token is not a master token"));
        }
        let masters = self.masters.read();
        let rec = masters
            .get(token.index())
            .filter(|r| r.live)
            .ok_or_else(|| CoreError::new(ErrorKind::InvalidReference, "unknown or freed master token"))?;
        Ok(rec.size)
    }

    pub fn lookup_slave(&self, token: Token) -> CoreResult<(DynAddr, Option<Descriptor>)> {
        if !token.is_slave() {
            return Err(CoreError::new(ErrorKind::InvalidReference, "token is not a slave token"));
        }
        let slaves = self.slaves.read();
        let rec = slaves
            .get(token.index())
            .filter(|r| r.live)
            .ok_or_else(|| CoreError::new(ErrorKind::InvalidReference, "unknown or freed slave token"))?;
        let addr = rec.addr.ok_or_else(|| {
            CoreError::new(ErrorKind::InvalidReference, "slave token is detached, not present")
        })?;
        Ok((addr, rec.descriptor.clone()))
    }

    /// Reallocates a slave token's memory in place (detach, free,
    /// allocate, attach) without destroying the token (spec.md §3).
    pub fn reattach_slave(
        &self,
        transport: &dyn RmaTransport,
        token: Token,
        size: usize,
        descriptor: Option<Descriptor>,
    ) -> CoreResult<()> {
        if !token.is_slave() {
            return Err(CoreError::new(ErrorKind::InvalidReference, "token is not a slave token"));
        }
        let mut slaves = self.slaves.write();
        let rec = slaves
            .get_mut(token.index())
            .filter(|r| r.live)
            .ok_or_else(|| CoreError::new(ErrorKind::InvalidReference, "unknown or freed slave token"))?;
        if let Some(old) = rec.addr.take() {
            transport.detach_dynamic(old)?;
        }
        let addr = transport.attach_dynamic(vec![0u8; size])?;
        rec.addr = Some(addr);
        rec.size = size;
        rec.descriptor = descriptor;
        Ok(())
    }

    pub fn deregister(
        &self,
        transport: &dyn RmaTransport,
        token: Token,
        mode: DeregisterMode,
    ) -> CoreResult<()> {
        if mode == DeregisterMode::Full {
            // A sync point precedes full deregistration so no peer still
            // holds an outstanding RMA against this window (spec.md §4.B).
            transport.barrier()?;
        }
        if token.is_slave() {
            let mut slaves = self.slaves.write();
            let rec = slaves
                .get_mut(token.index())
                .filter(|r| r.live)
                .ok_or_else(|| CoreError::new(ErrorKind::InvalidReference, "unknown or freed slave token"))?;
            if let Some(addr) = rec.addr.take() {
                transport.detach_dynamic(addr)?;
            }
            if mode == DeregisterMode::Full {
                rec.live = false;
                rec.descriptor = None;
            }
        } else {
            let mut masters = self.masters.write();
            let rec = masters
                .get_mut(token.index())
                .filter(|r| r.live)
                .ok_or_else(|| CoreError::new(ErrorKind::InvalidReference, "unknown or freed master token"))?;
            if mode == DeregisterMode::Full {
                transport.free_window(rec.window)?;
                rec.live = false;
                rec.descriptor = None;
            } else {
                // Master tokens have no separate detach step; "deallocate
                // only" zeroes the window's backing bytes and keeps both
                // the token and the window alive for later reuse.
                let zeros = vec![0u8; rec.kind.window_bytes(rec.size)];
                transport.lock(rec.window, transport.this_image(), LockMode::Exclusive)?;
                transport.put(rec.window, transport.this_image(), 0, &zeros)?;
                transport.unlock(rec.window, transport.this_image())?;
            }
        }
        Ok(())
    }

    /// Mass release at finalize (spec.md §4.C): frees every live slave
    /// token, then every live master token.
    pub fn finalize_all(&self, transport: &dyn RmaTransport) {
        let slave_tokens: Vec<Token> = {
            let slaves = self.slaves.read();
            (0..slaves.len()).filter(|i| slaves[*i].live).map(Token::slave).collect()
        };
        for token in slave_tokens {
            let _ = self.deregister(transport, token, DeregisterMode::Full);
        }
        let master_tokens: Vec<Token> = {
            let masters = self.masters.read();
            (0..masters.len()).filter(|i| masters[*i].live).map(Token::master).collect()
        };
        for token in master_tokens {
            let _ = self.deregister(transport, token, DeregisterMode::Full);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_kind_bit() {
        let m = Token::master(7);
        let s = Token::slave(7);
        assert!(!m.is_slave());
        assert!(s.is_slave());
        assert_eq!(m.index(), 7);
        assert_eq!(s.index(), 7);
    }
}
