// Copyright (C) 2024, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Server push correlation.
//!
//! A pushed exchange becomes visible in two halves that may arrive in
//! either order: a PUSH_PROMISE frame on a request stream, and a push
//! stream whose preface is followed by the same push ID. This module keeps
//! the correlation table between the two.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use crate::transaction::TransactionHandler;
use crate::Error;
use crate::Header;
use crate::Result;

/// A server push identifier.
///
/// Push IDs share the varint value space with stream IDs on the wire, so
/// they get a distinct type to keep the two from being quietly misplaced.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct PushId(u64);

impl PushId {
    pub fn new(v: u64) -> PushId {
        PushId(v)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for PushId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instrumentation callbacks for the server push lifecycle.
///
/// All methods default to no-ops; implementations override what they need.
pub trait PushLifecycleObserver {
    /// A PUSH_PROMISE frame was identified on a request stream.
    fn push_promise_begin(&mut self, assoc_stream_id: u64, push_id: PushId) {
        let _ = (assoc_stream_id, push_id);
    }

    /// A PUSH_PROMISE frame was fully parsed.
    fn push_promise(
        &mut self, assoc_stream_id: u64, push_id: PushId, headers: &[Header],
    ) {
        let _ = (assoc_stream_id, push_id, headers);
    }

    /// First bytes landed on a PUSH-typed unidirectional stream.
    fn nascent_push_stream_begin(&mut self, stream_id: u64, is_eof: bool) {
        let _ = (stream_id, is_eof);
    }

    /// The unframed push ID of a nascent stream was decoded.
    fn nascent_push_stream(
        &mut self, stream_id: u64, push_id: PushId, is_eof: bool,
    ) {
        let _ = (stream_id, push_id, is_eof);
    }

    /// A nascent stream ended before being adopted by a promise.
    fn nascent_eof(&mut self, stream_id: u64, push_id: Option<PushId>) {
        let _ = (stream_id, push_id);
    }

    /// A nascent stream was discarded without ever being adopted.
    fn orphaned_nascent_stream(
        &mut self, stream_id: u64, push_id: Option<PushId>,
    ) {
        let _ = (stream_id, push_id);
    }

    /// A promise was seen but its push stream has not arrived yet.
    fn half_open_pushed_txn(&mut self, push_id: PushId, assoc_stream_id: u64) {
        let _ = (push_id, assoc_stream_id);
    }

    /// Promise and stream were correlated into a pushed transaction.
    fn pushed_txn(
        &mut self, stream_id: u64, push_id: PushId, assoc_stream_id: u64,
    ) {
        let _ = (stream_id, push_id, assoc_stream_id);
    }

    /// A half-open pushed transaction timed out waiting for its stream.
    fn pushed_txn_timeout(&mut self, push_id: PushId) {
        let _ = push_id;
    }

    /// A half-open pushed transaction was discarded at teardown.
    fn orphaned_half_open_pushed_txn(&mut self, push_id: PushId) {
        let _ = push_id;
    }
}

/// A parsed promise waiting for (or bound to) its push stream.
pub(crate) struct Promise {
    pub assoc_stream_id: u64,
    pub headers: Vec<Header>,
    pub handler: Option<Rc<RefCell<dyn TransactionHandler>>>,

    /// The push stream this promise was bound to, once correlated.
    pub bound_stream_id: Option<u64>,

    /// Deadline for the push stream to show up.
    pub deadline: Instant,
}

/// The push-id-keyed correlation table.
///
/// A `BTreeMap` keeps iteration deterministic for teardown fan-out.
#[derive(Default)]
pub(crate) struct PushCoordinator {
    promises: BTreeMap<PushId, Promise>,
}

impl PushCoordinator {
    /// Records a parsed PUSH_PROMISE. Reusing a push ID for a second
    /// promise is a connection error.
    pub fn on_promise(
        &mut self, push_id: PushId, assoc_stream_id: u64, headers: Vec<Header>,
        deadline: Instant,
    ) -> Result<()> {
        if self.promises.contains_key(&push_id) {
            return Err(Error::IdError);
        }

        self.promises.insert(push_id, Promise {
            assoc_stream_id,
            headers,
            handler: None,
            bound_stream_id: None,
            deadline,
        });

        Ok(())
    }

    pub fn promise(&self, push_id: PushId) -> Option<&Promise> {
        self.promises.get(&push_id)
    }

    pub fn promise_mut(&mut self, push_id: PushId) -> Option<&mut Promise> {
        self.promises.get_mut(&push_id)
    }

    /// Binds a nascent stream to its promise, if one was seen.
    ///
    /// Returns the associated stream ID on success. Binding a push ID that
    /// was already bound to a different stream is a connection error.
    pub fn bind_stream(
        &mut self, push_id: PushId, stream_id: u64,
    ) -> Result<Option<u64>> {
        match self.promises.get_mut(&push_id) {
            Some(p) => match p.bound_stream_id {
                Some(bound) if bound != stream_id => Err(Error::IdError),

                _ => {
                    p.bound_stream_id = Some(stream_id);

                    Ok(Some(p.assoc_stream_id))
                },
            },

            None => Ok(None),
        }
    }

    pub fn remove(&mut self, push_id: PushId) -> Option<Promise> {
        self.promises.remove(&push_id)
    }

    /// Push IDs of promises still waiting for their stream at `now`.
    pub fn expired_half_open(&self, now: Instant) -> Vec<PushId> {
        self.promises
            .iter()
            .filter(|(_, p)| p.bound_stream_id.is_none() && p.deadline <= now)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Earliest half-open deadline, if any promise is still waiting.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.promises
            .values()
            .filter(|p| p.bound_stream_id.is_none())
            .map(|p| p.deadline)
            .min()
    }

    /// Drains every promise that never got its stream, for teardown.
    pub fn drain_half_open(&mut self) -> Vec<PushId> {
        let ids: Vec<PushId> = self
            .promises
            .iter()
            .filter(|(_, p)| p.bound_stream_id.is_none())
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            self.promises.remove(id);
        }

        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[test]
    /// Promise first, stream second.
    fn promise_then_stream() {
        let mut c = PushCoordinator::default();

        c.on_promise(PushId::new(1), 0, vec![], deadline()).unwrap();
        assert_eq!(c.bind_stream(PushId::new(1), 15), Ok(Some(0)));
        assert_eq!(c.promise(PushId::new(1)).unwrap().bound_stream_id, Some(15));
    }

    #[test]
    /// Stream first: binding reports no promise, and succeeds once the
    /// promise shows up.
    fn stream_then_promise() {
        let mut c = PushCoordinator::default();

        assert_eq!(c.bind_stream(PushId::new(1), 15), Ok(None));

        c.on_promise(PushId::new(1), 0, vec![], deadline()).unwrap();
        assert_eq!(c.bind_stream(PushId::new(1), 15), Ok(Some(0)));
    }

    #[test]
    /// Reusing a push ID for a second promise is a connection error.
    fn push_id_reuse() {
        let mut c = PushCoordinator::default();

        c.on_promise(PushId::new(1), 0, vec![], deadline()).unwrap();
        assert_eq!(
            c.on_promise(PushId::new(1), 4, vec![], deadline()),
            Err(Error::IdError)
        );
    }

    #[test]
    /// Binding the same push ID to two different streams is an error.
    fn double_bind() {
        let mut c = PushCoordinator::default();

        c.on_promise(PushId::new(1), 0, vec![], deadline()).unwrap();
        assert_eq!(c.bind_stream(PushId::new(1), 15), Ok(Some(0)));
        assert_eq!(c.bind_stream(PushId::new(1), 19), Err(Error::IdError));
    }

    #[test]
    fn half_open_expiry() {
        let mut c = PushCoordinator::default();
        let now = Instant::now();

        c.on_promise(PushId::new(1), 0, vec![], now).unwrap();
        c.on_promise(PushId::new(3), 0, vec![], now + Duration::from_secs(5))
            .unwrap();

        let expired = c.expired_half_open(now + Duration::from_secs(1));
        assert_eq!(expired, vec![PushId::new(1)]);

        // A bound promise no longer expires.
        c.bind_stream(PushId::new(3), 15).unwrap();
        assert_eq!(c.next_deadline(), None);
    }
}
