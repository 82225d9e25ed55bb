//! Client replica with optimistic local editing.
//!
//! The client commits local transactions immediately and keeps them in an
//! unconfirmed queue anchored at `confirmed_length`, the server history
//! index the replica has fully incorporated. When a foreign committed
//! change arrives, the queue is rebased over it:
//!
//!   1. unapply the whole unconfirmed queue, newest first;
//!   2. commit the remote change as-is;
//!   3. rewrite the queue across the remote change and recommit the
//!      survivors.
//!
//! The echo of the replica's own submission needs none of that: by the time
//! it arrives, every interleaved foreign change has already rebased the
//! queue with the same deterministic rewrite the server used, so the echo
//! merely confirms the queue's front and advances the watermark.
//!
//! At most one submission is in flight at a time, so a submitted change is
//! always anchored exactly at the server history the client has confirmed.

use std::collections::BTreeMap;

use log::{debug, warn};
use weft_core::{DocumentEvent, LinearDocument, StoreDelta, Transaction, TransactionProcessor};

use crate::change::Change;
use crate::error::CollabError;
use crate::protocol::DocumentSnapshot;
use crate::selection::{AuthorId, Selection};
use crate::transform::{transform_change, TransformLog};

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upper bound on unconfirmed local transactions before further local
    /// edits are refused.
    pub max_unconfirmed: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_unconfirmed: 4096,
        }
    }
}

/// What [`RebaseClient::accept`] did with an incoming committed change.
#[derive(Debug, Clone, PartialEq)]
pub enum AcceptOutcome {
    /// A foreign change was applied; the queue was rebased over it. The log
    /// records any local work the rebase dropped.
    Applied {
        events: Vec<DocumentEvent>,
        log: TransformLog,
    },
    /// Our own submission came back; the watermark advanced.
    Confirmed,
    /// Everything in the change was already incorporated.
    Ignored,
    /// Remote application is paused; the change was buffered.
    Buffered,
}

pub struct RebaseClient {
    author_id: AuthorId,
    config: ClientConfig,
    doc: LinearDocument,
    /// Server history length this replica has incorporated.
    confirmed_length: usize,
    /// Transactions of the queue already submitted (0 or the whole queue).
    sent_length: usize,
    /// Unconfirmed local transactions; `local.start == confirmed_length`.
    local: Change,
    selection: Option<Selection>,
    /// Other authors' last known selections, in committed-document
    /// coordinates.
    remote_selections: BTreeMap<AuthorId, Selection>,
    paused: bool,
    buffered: Vec<(AuthorId, Change)>,
    /// Set when a history gap was detected; only a fresh snapshot clears it.
    needs_resync: bool,
}

impl RebaseClient {
    pub fn new(author_id: AuthorId) -> Self {
        Self::with_config(author_id, ClientConfig::default())
    }

    pub fn with_config(author_id: AuthorId, config: ClientConfig) -> Self {
        Self {
            author_id,
            config,
            doc: LinearDocument::empty(),
            confirmed_length: 0,
            sent_length: 0,
            local: Change::empty(0),
            selection: None,
            remote_selections: BTreeMap::new(),
            paused: false,
            buffered: Vec::new(),
            needs_resync: false,
        }
    }

    /// Join from a server snapshot.
    pub fn from_snapshot(author_id: AuthorId, snapshot: &DocumentSnapshot) -> Result<Self, CollabError> {
        let mut client = Self::new(author_id);
        client.load_snapshot(snapshot)?;
        Ok(client)
    }

    /// Replace all state with a server snapshot. This is the resync path:
    /// any unconfirmed local work is discarded.
    pub fn load_snapshot(&mut self, snapshot: &DocumentSnapshot) -> Result<(), CollabError> {
        if !self.local.is_empty() {
            warn!(
                "resync discards {} unconfirmed local transaction(s)",
                self.local.len()
            );
        }
        let mut doc = LinearDocument::from_items(snapshot.items.clone())?;
        doc.store_mut().absorb(&snapshot.store)?;
        self.doc = doc;
        self.confirmed_length = snapshot.history_length;
        self.sent_length = 0;
        self.local = Change::empty(snapshot.history_length);
        self.remote_selections = snapshot.selections.clone();
        self.remote_selections.remove(&self.author_id);
        self.buffered.clear();
        self.needs_resync = false;
        Ok(())
    }

    pub fn author_id(&self) -> AuthorId {
        self.author_id
    }

    pub fn document(&self) -> &LinearDocument {
        &self.doc
    }

    pub fn confirmed_length(&self) -> usize {
        self.confirmed_length
    }

    /// Local transactions not yet confirmed by the server.
    pub fn unconfirmed(&self) -> &Change {
        &self.local
    }

    pub fn selection(&self) -> Option<Selection> {
        self.selection
    }

    pub fn set_selection(&mut self, selection: Option<Selection>) {
        self.selection = selection;
    }

    /// Other authors' selections, translated through the unconfirmed queue
    /// so they sit in this replica's current document.
    pub fn remote_selections(&self) -> BTreeMap<AuthorId, Selection> {
        self.remote_selections
            .iter()
            .map(|(author, selection)| {
                let mut moved = *selection;
                for txn in &self.local.transactions {
                    moved = moved.translate_through(txn);
                }
                (*author, moved)
            })
            .collect()
    }

    /// Forget a departed author's selection.
    pub fn remove_remote_author(&mut self, author: &AuthorId) {
        self.remote_selections.remove(author);
    }

    /// Drift stored remote selections with a newly committed change, then
    /// absorb the selections it bundles.
    fn absorb_selections(&mut self, change: &Change) {
        for (author, selection) in self.remote_selections.iter_mut() {
            if change.selections.contains_key(author) {
                continue;
            }
            for txn in &change.transactions {
                *selection = selection.translate_through(txn);
            }
        }
        for (author, selection) in &change.selections {
            if *author != self.author_id {
                self.remote_selections.insert(*author, *selection);
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn needs_resync(&self) -> bool {
        self.needs_resync
    }

    fn guard_synced(&self) -> Result<(), CollabError> {
        if self.needs_resync {
            return Err(CollabError::ProtocolViolation(
                "replica requires a snapshot resync".into(),
            ));
        }
        Ok(())
    }

    /// Commit a local transaction optimistically and queue it for
    /// submission. `store` carries any annotation values it introduces.
    pub fn apply_local(
        &mut self,
        mut transaction: Transaction,
        store: StoreDelta,
    ) -> Result<Vec<DocumentEvent>, CollabError> {
        self.guard_synced()?;
        if self.local.len() >= self.config.max_unconfirmed {
            return Err(CollabError::BadChange(format!(
                "unconfirmed queue is full ({} transactions)",
                self.local.len()
            )));
        }
        self.doc.store_mut().absorb(&store)?;
        let events = self.doc.commit(&mut transaction)?;
        if let Some(selection) = self.selection.as_mut() {
            *selection = selection.translate_through(&transaction);
        }
        self.local.push(transaction, store);
        Ok(events)
    }

    /// True when there is unsubmitted work and nothing in flight.
    pub fn can_submit(&self) -> bool {
        !self.needs_resync && self.sent_length == 0 && !self.local.is_empty()
    }

    /// Squash the unconfirmed queue into a single-transaction change and
    /// hand it over for sending. Returns `None` while a previous submission
    /// is still unconfirmed.
    ///
    /// The queue itself is replaced by its squashed form so that the later
    /// echo confirms exactly what is held locally.
    pub fn submit(&mut self) -> Result<Option<Change>, CollabError> {
        self.guard_synced()?;
        if !self.can_submit() {
            return Ok(None);
        }
        self.local = self.local.squashed()?;
        let mut change = self.local.clone();
        if let Some(selection) = self.selection {
            change.selections.insert(self.author_id, selection);
        }
        self.sent_length = change.len();
        debug!(
            "submitting {} transaction(s) at history {}",
            change.len(),
            change.start
        );
        Ok(Some(change))
    }

    /// Incorporate a committed change broadcast by the server.
    pub fn accept(
        &mut self,
        author: AuthorId,
        change: &Change,
    ) -> Result<AcceptOutcome, CollabError> {
        self.guard_synced()?;
        change.validate()?;
        if self.paused {
            self.buffered.push((author, change.clone()));
            return Ok(AcceptOutcome::Buffered);
        }
        if change.start > self.confirmed_length {
            // Missed at least one broadcast; only a snapshot can recover.
            self.needs_resync = true;
            return Err(CollabError::StaleHistory {
                local: self.confirmed_length,
                remote: change.start,
            });
        }
        if change.end() <= self.confirmed_length {
            return Ok(AcceptOutcome::Ignored);
        }
        let change = change.most_recent(self.confirmed_length)?;

        if author == self.author_id {
            self.confirm_echo(&change);
            self.absorb_selections(&change);
            return Ok(AcceptOutcome::Confirmed);
        }
        let (events, log) = self.rebase_over(&change)?;
        self.absorb_selections(&change);
        Ok(AcceptOutcome::Applied { events, log })
    }

    /// The echo of our own submission: the queue front already matches the
    /// committed form, so only the watermarks move.
    fn confirm_echo(&mut self, change: &Change) {
        let confirmed = change.len().min(self.local.len());
        debug_assert_eq!(confirmed, change.len());
        self.confirmed_length += change.len();
        self.sent_length = self.sent_length.saturating_sub(confirmed);
        self.local = self
            .local
            .most_recent(self.confirmed_length)
            .unwrap_or_else(|_| Change::empty(self.confirmed_length));
        debug!(
            "confirmed {confirmed} transaction(s), history now {}",
            self.confirmed_length
        );
    }

    /// Unapply the queue, commit the foreign change, recommit the rewritten
    /// survivors. Staged on a copy: on any error the replica is unchanged.
    fn rebase_over(
        &mut self,
        change: &Change,
    ) -> Result<(Vec<DocumentEvent>, TransformLog), CollabError> {
        let mut staged = self.doc.clone();
        let mut events = Vec::new();

        for txn in self.local.transactions.iter().rev() {
            let mut inverse = txn.invert();
            events.extend(TransactionProcessor::process(&mut staged, &mut inverse, true)?);
        }
        events.extend(change.commit_to(&mut staged)?);

        let (mut rebased, log) = transform_change(&self.local, change)?;
        if !log.is_clean() {
            debug!(
                "remote change dropped {} local operation(s)",
                log.rejections.len()
            );
        }
        for index in 0..rebased.transactions.len() {
            staged.store_mut().absorb(&rebased.stores[index])?;
            events.extend(TransactionProcessor::process(
                &mut staged,
                &mut rebased.transactions[index],
                true,
            )?);
        }

        if let Some(selection) = self.selection {
            let mut moved = selection;
            for txn in self.local.transactions.iter().rev() {
                moved = moved.translate_through(&txn.invert());
            }
            for txn in &change.transactions {
                moved = moved.translate_through(txn);
            }
            for txn in &rebased.transactions {
                moved = moved.translate_through(txn);
            }
            self.selection = Some(moved);
        }

        self.doc = staged;
        self.confirmed_length = change.end();
        self.sent_length = if self.sent_length > 0 {
            rebased.len()
        } else {
            0
        };
        self.local = rebased;
        Ok((events, log))
    }

    /// Stop applying remote changes; they are buffered until [`resume`].
    ///
    /// [`resume`]: RebaseClient::resume
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Replay everything buffered while paused, in arrival order.
    pub fn resume(&mut self) -> Result<Vec<AcceptOutcome>, CollabError> {
        self.paused = false;
        let buffered = std::mem::take(&mut self.buffered);
        let mut outcomes = Vec::with_capacity(buffered.len());
        for (author, change) in buffered {
            outcomes.push(self.accept(author, &change)?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;
    use weft_core::DataItem;

    fn paragraph(text: &str) -> Vec<DataItem> {
        let mut items = vec![DataItem::open("paragraph")];
        items.extend(text.chars().map(DataItem::scalar));
        items.push(DataItem::close("paragraph"));
        items
    }

    fn scalars(text: &str) -> Vec<DataItem> {
        text.chars().map(DataItem::scalar).collect()
    }

    fn snapshot(text: &str, history_length: usize) -> DocumentSnapshot {
        DocumentSnapshot {
            items: paragraph(text),
            store: StoreDelta::default(),
            history_length,
            selections: BTreeMap::new(),
        }
    }

    fn insert_txn(doc: &LinearDocument, offset: usize, text: &str) -> Transaction {
        Transaction::insert_at(doc.len(), offset, scalars(text)).unwrap()
    }

    #[test]
    fn test_optimistic_apply_and_submit() {
        let mut client = RebaseClient::from_snapshot(Uuid::new_v4(), &snapshot("ab", 3)).unwrap();
        assert_eq!(client.confirmed_length(), 3);
        assert!(!client.can_submit());

        let txn = insert_txn(client.document(), 1, "X");
        client.apply_local(txn, StoreDelta::default()).unwrap();
        assert_eq!(client.document().content_summary(), "Xab");

        let change = client.submit().unwrap().unwrap();
        assert_eq!(change.start, 3);
        assert_eq!(change.len(), 1);

        // One in flight: no second submission until it confirms.
        let txn = insert_txn(client.document(), 2, "Y");
        client.apply_local(txn, StoreDelta::default()).unwrap();
        assert_eq!(client.submit().unwrap(), None);
    }

    #[test]
    fn test_echo_advances_watermark() {
        let author = Uuid::new_v4();
        let mut client = RebaseClient::from_snapshot(author, &snapshot("ab", 0)).unwrap();

        let txn = insert_txn(client.document(), 1, "X");
        client.apply_local(txn, StoreDelta::default()).unwrap();
        let change = client.submit().unwrap().unwrap();

        let outcome = client.accept(author, &change).unwrap();
        assert_eq!(outcome, AcceptOutcome::Confirmed);
        assert_eq!(client.confirmed_length(), 1);
        assert!(client.unconfirmed().is_empty());
        assert!(!client.can_submit());
        assert_eq!(client.document().content_summary(), "Xab");
    }

    #[test]
    fn test_foreign_change_rebases_queue() {
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let mut client = RebaseClient::from_snapshot(bob, &snapshot("", 0)).unwrap();

        // Bob types optimistically.
        let txn = insert_txn(client.document(), 1, "AB");
        client.apply_local(txn, StoreDelta::default()).unwrap();
        assert_eq!(client.document().content_summary(), "AB");

        // Alice's concurrent insert at the same offset was committed first.
        let remote = Change::from_transaction(
            0,
            Transaction::insert_at(2, 1, scalars("abc")).unwrap(),
            StoreDelta::default(),
        );
        let outcome = client.accept(alice, &remote).unwrap();
        assert!(matches!(outcome, AcceptOutcome::Applied { .. }));

        assert_eq!(client.document().content_summary(), "abcAB");
        assert_eq!(client.confirmed_length(), 1);
        assert_eq!(client.unconfirmed().start, 1);
        assert_eq!(client.unconfirmed().len(), 1);
    }

    #[test]
    fn test_already_seen_change_is_ignored() {
        let mut client = RebaseClient::from_snapshot(Uuid::new_v4(), &snapshot("ab", 5)).unwrap();
        let old = Change::from_transaction(
            3,
            Transaction::insert_at(4, 1, scalars("z")).unwrap(),
            StoreDelta::default(),
        );
        assert_eq!(
            client.accept(Uuid::new_v4(), &old).unwrap(),
            AcceptOutcome::Ignored
        );
    }

    #[test]
    fn test_history_gap_forces_resync() {
        let mut client = RebaseClient::from_snapshot(Uuid::new_v4(), &snapshot("ab", 2)).unwrap();
        let future = Change::from_transaction(
            4,
            Transaction::insert_at(4, 1, scalars("z")).unwrap(),
            StoreDelta::default(),
        );
        assert!(matches!(
            client.accept(Uuid::new_v4(), &future),
            Err(CollabError::StaleHistory { local: 2, remote: 4 })
        ));
        assert!(client.needs_resync());
        assert!(client.submit().is_err());

        client.load_snapshot(&snapshot("abz", 5)).unwrap();
        assert!(!client.needs_resync());
        assert_eq!(client.confirmed_length(), 5);
    }

    #[test]
    fn test_pause_buffers_and_resume_replays() {
        let alice = Uuid::new_v4();
        let mut client = RebaseClient::from_snapshot(Uuid::new_v4(), &snapshot("ab", 0)).unwrap();

        client.pause();
        let remote = Change::from_transaction(
            0,
            Transaction::insert_at(4, 1, scalars("X")).unwrap(),
            StoreDelta::default(),
        );
        assert_eq!(
            client.accept(alice, &remote).unwrap(),
            AcceptOutcome::Buffered
        );
        assert_eq!(client.document().content_summary(), "ab");

        let outcomes = client.resume().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], AcceptOutcome::Applied { .. }));
        assert_eq!(client.document().content_summary(), "Xab");
        assert_eq!(client.confirmed_length(), 1);
    }

    #[test]
    fn test_failed_rebase_leaves_replica_untouched() {
        let alice = Uuid::new_v4();
        let mut client = RebaseClient::from_snapshot(Uuid::new_v4(), &snapshot("ab", 0)).unwrap();
        let txn = insert_txn(client.document(), 1, "X");
        client.apply_local(txn, StoreDelta::default()).unwrap();

        // Remote change whose removal does not match the document.
        let bogus = Change::from_transaction(
            0,
            Transaction::remove_range(&paragraph("zz"), 1..2).unwrap(),
            StoreDelta::default(),
        );
        assert!(client.accept(alice, &bogus).is_err());
        assert_eq!(client.document().content_summary(), "Xab");
        assert_eq!(client.unconfirmed().len(), 1);
        assert_eq!(client.confirmed_length(), 0);
    }

    #[test]
    fn test_submit_squashes_the_queue() {
        let author = Uuid::new_v4();
        let mut client = RebaseClient::from_snapshot(author, &snapshot("ab", 0)).unwrap();

        let txn = insert_txn(client.document(), 1, "X");
        client.apply_local(txn, StoreDelta::default()).unwrap();
        let txn = insert_txn(client.document(), 2, "Y");
        client.apply_local(txn, StoreDelta::default()).unwrap();
        assert_eq!(client.unconfirmed().len(), 2);

        // A burst of edits goes out as one transaction, and the queue is
        // replaced by the same squashed form so the echo matches it.
        let change = client.submit().unwrap().unwrap();
        assert_eq!(change.len(), 1);
        assert_eq!(client.unconfirmed().len(), 1);

        client.accept(author, &change).unwrap();
        assert!(client.unconfirmed().is_empty());
        assert_eq!(client.confirmed_length(), 1);
        assert_eq!(client.document().content_summary(), "XYab");
    }

    #[test]
    fn test_remote_selections_follow_committed_edits() {
        let alice = Uuid::new_v4();
        let mut client = RebaseClient::from_snapshot(Uuid::new_v4(), &snapshot("ab", 0)).unwrap();

        let mut remote = Change::from_transaction(
            0,
            Transaction::insert_at(4, 1, scalars("XY")).unwrap(),
            StoreDelta::default(),
        );
        remote.selections.insert(alice, Selection::collapsed(3));
        client.accept(alice, &remote).unwrap();
        assert_eq!(
            client.remote_selections().get(&alice),
            Some(&Selection::collapsed(3))
        );

        // A local unconfirmed insert ahead of alice's cursor shifts the
        // surfaced position without touching the stored one.
        let txn = insert_txn(client.document(), 1, "z");
        client.apply_local(txn, StoreDelta::default()).unwrap();
        assert_eq!(
            client.remote_selections().get(&alice),
            Some(&Selection::collapsed(4))
        );

        client.remove_remote_author(&alice);
        assert!(client.remote_selections().is_empty());
    }

    #[test]
    fn test_selection_tracks_rebase() {
        let alice = Uuid::new_v4();
        let mut client = RebaseClient::from_snapshot(Uuid::new_v4(), &snapshot("ab", 0)).unwrap();
        client.set_selection(Some(Selection::collapsed(2)));

        let remote = Change::from_transaction(
            0,
            Transaction::insert_at(4, 1, scalars("XY")).unwrap(),
            StoreDelta::default(),
        );
        client.accept(alice, &remote).unwrap();
        assert_eq!(client.selection(), Some(Selection::collapsed(4)));
    }
}
