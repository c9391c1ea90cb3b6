//! The daemon's single owner of display state, profiles and in-flight
//! transactions. Every entry point runs on the event loop thread and takes
//! the [`OutputManager`] it should submit through.

use std::{collections::HashMap, rc::Rc};

use crate::{
    apply::{OutputManager, PendingTransaction, TransactionId},
    errors::ControlError,
    hooks::HookRunner,
    matcher::{match_best, match_profile},
    model::DisplayModel,
    profile::{Profile, ProfileStore},
};

/// Called once with the final result of a `reload` or `switch` request.
pub type Completion = Box<dyn FnOnce(Result<(), ControlError>)>;

pub(crate) fn complete(completion: Option<Completion>, result: Result<(), ControlError>) {
    if let Some(completion) = completion {
        completion(result);
    }
}

pub struct Session {
    pub(crate) model: DisplayModel,
    pub(crate) store: ProfileStore,
    pub(crate) current: Option<Rc<Profile>>,
    pub(crate) pending: Option<Rc<Profile>>,
    pub(crate) serial: u32,
    pub(crate) transactions: HashMap<TransactionId, PendingTransaction>,
    next_transaction: u64,
    pub(crate) rematch_scheduled: bool,
    pub(crate) hooks: Box<dyn HookRunner>,
}

impl Session {
    pub fn new(store: ProfileStore, hooks: Box<dyn HookRunner>) -> Self {
        Self {
            model: DisplayModel::new(),
            store,
            current: None,
            pending: None,
            serial: 0,
            transactions: HashMap::new(),
            next_transaction: 0,
            rematch_scheduled: false,
            hooks,
        }
    }

    pub fn model(&self) -> &DisplayModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut DisplayModel {
        &mut self.model
    }

    pub fn store(&self) -> &ProfileStore {
        &self.store
    }

    pub fn current_profile(&self) -> Option<&Rc<Profile>> {
        self.current.as_ref()
    }

    pub fn pending_profile(&self) -> Option<&Rc<Profile>> {
        self.pending.as_ref()
    }

    /// Serial of the last `done` event.
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub fn pending_transactions(&self) -> usize {
        self.transactions.len()
    }

    pub(crate) fn is_current(&self, profile: &Rc<Profile>) -> bool {
        self.current.as_ref().is_some_and(|current| Rc::ptr_eq(current, profile))
    }

    pub(crate) fn is_pending(&self, profile: &Rc<Profile>) -> bool {
        self.pending.as_ref().is_some_and(|pending| Rc::ptr_eq(pending, profile))
    }

    pub(crate) fn allocate_transaction_id(&mut self) -> TransactionId {
        let id = TransactionId::new(self.next_transaction);
        self.next_transaction = self.next_transaction.wrapping_add(1);
        id
    }

    /// The compositor finished a batch of head/mode notifications.
    pub fn on_topology_settled(&mut self, serial: u32, manager: &mut dyn OutputManager) {
        tracing::debug!(serial, heads = self.model.len(), "output topology settled");
        self.serial = serial;
        self.match_and_apply(None, manager);
    }

    /// Replaces the profile store and re-matches from scratch.
    pub fn reload(
        &mut self,
        store: ProfileStore,
        completion: Option<Completion>,
        manager: &mut dyn OutputManager,
    ) {
        tracing::info!(profiles = store.len(), "profiles reloaded");
        self.store = store;
        self.current = None;
        self.pending = None;
        self.match_and_apply(completion, manager);
    }

    /// Applies the named profile if, and only if, it matches the current
    /// topology.
    pub fn switch(&mut self, name: &str, completion: Option<Completion>, manager: &mut dyn OutputManager) {
        let Some(profile) = self.store.find(name).map(Rc::clone) else {
            tracing::warn!(profile = %name, "no profile with that name");
            complete(completion, Err(ControlError::ProfileNotFound));
            return;
        };

        let Some(assignment) = match_profile(&self.model, &profile) else {
            tracing::warn!(profile = %name, "profile does not match connected outputs");
            complete(completion, Err(ControlError::ProfileNotMatched));
            return;
        };

        self.apply_profile(profile, &assignment, completion, manager);
    }

    /// Runs work deferred by a transaction outcome. Returns whether anything
    /// ran.
    pub fn run_scheduled(&mut self, manager: &mut dyn OutputManager) -> bool {
        if !std::mem::take(&mut self.rematch_scheduled) {
            return false;
        }
        tracing::debug!(serial = self.serial, "running scheduled re-match");
        self.match_and_apply(None, manager);
        true
    }

    fn match_and_apply(&mut self, completion: Option<Completion>, manager: &mut dyn OutputManager) {
        if let Some(current) = &self.current
            && match_profile(&self.model, current).is_some()
        {
            tracing::debug!(profile = %current.name, "current profile still matches");
            complete(completion, Ok(()));
            return;
        }

        match match_best(&self.model, self.store.profiles()) {
            Some((profile, assignment)) => {
                self.apply_profile(profile, &assignment, completion, manager);
            }
            None => {
                tracing::info!(heads = self.model.len(), "no profile matched");
                complete(completion, Err(ControlError::ProfileNotMatched));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{
        PerchError, Result,
        apply::{HeadConfig, Outcome, Transaction},
        model::HeadId,
        profile::{ModeRequest, OutputConstraint},
    };

    #[derive(Default)]
    struct FakeManager {
        submitted: Vec<Transaction>,
        reject: bool,
    }

    impl FakeManager {
        fn last_id(&self) -> TransactionId {
            self.submitted.last().unwrap().id
        }
    }

    impl OutputManager for FakeManager {
        fn submit(&mut self, transaction: &Transaction) -> Result<()> {
            if self.reject {
                return Err(PerchError::Wayland("manager is gone".to_owned()));
            }
            self.submitted.push(transaction.clone());
            Ok(())
        }
    }

    struct RecordingHooks(Rc<RefCell<Vec<String>>>);

    impl HookRunner for RecordingHooks {
        fn run(&mut self, command: &str) -> std::io::Result<()> {
            self.0.borrow_mut().push(command.to_owned());
            if command == "fail" {
                return Err(std::io::Error::other("boom"));
            }
            Ok(())
        }
    }

    type Replies = Rc<RefCell<Vec<Result<(), ControlError>>>>;

    fn recorder(replies: &Replies) -> Option<Completion> {
        let replies = Rc::clone(replies);
        Some(Box::new(move |result| replies.borrow_mut().push(result)))
    }

    fn session(profiles: Vec<Profile>) -> (Session, Rc<RefCell<Vec<String>>>) {
        let ran = Rc::new(RefCell::new(Vec::new()));
        let hooks = Box::new(RecordingHooks(Rc::clone(&ran)));
        (Session::new(ProfileStore::new(profiles), hooks), ran)
    }

    fn connect(session: &mut Session, name: &str) -> HeadId {
        let id = session.model_mut().add_head();
        let head = session.model_mut().head_mut(id).unwrap();
        head.name = name.to_owned();
        head.set_enabled(true);
        id
    }

    fn named(name: &str, selectors: &[&str]) -> Profile {
        Profile::new(
            name,
            selectors.iter().map(|s| OutputConstraint::new(*s)).collect(),
            Vec::new(),
        )
    }

    fn current_name(session: &Session) -> Option<&str> {
        session.current_profile().map(|p| p.name.as_str())
    }

    fn pending_name(session: &Session) -> Option<&str> {
        session.pending_profile().map(|p| p.name.as_str())
    }

    #[test]
    fn repeated_done_does_not_resubmit_pending_profile() {
        let (mut session, _) = session(vec![named("laptop", &["eDP-1"])]);
        let mut manager = FakeManager::default();
        connect(&mut session, "eDP-1");

        session.on_topology_settled(1, &mut manager);
        session.on_topology_settled(2, &mut manager);
        assert_eq!(manager.submitted.len(), 1);
        assert_eq!(pending_name(&session), Some("laptop"));

        session.handle_outcome(manager.last_id(), Outcome::Succeeded);
        session.on_topology_settled(3, &mut manager);
        assert_eq!(manager.submitted.len(), 1);
        assert_eq!(current_name(&session), Some("laptop"));
        assert!(session.pending_profile().is_none());
    }

    #[test]
    fn docking_switches_profiles_and_runs_commands_in_order() {
        let docked = Profile::new(
            "docked",
            vec![
                OutputConstraint {
                    enabled: Some(false),
                    ..OutputConstraint::new("eDP-1")
                },
                OutputConstraint::new("DP-1"),
            ],
            vec!["first".to_owned(), "fail".to_owned(), "third".to_owned()],
        );
        let (mut session, ran) = session(vec![named("laptop-only", &["eDP-1"]), docked]);
        let mut manager = FakeManager::default();
        let laptop = connect(&mut session, "eDP-1");

        session.on_topology_settled(1, &mut manager);
        session.handle_outcome(manager.last_id(), Outcome::Succeeded);
        assert_eq!(current_name(&session), Some("laptop-only"));
        assert!(ran.borrow().is_empty());

        connect(&mut session, "DP-1");
        session.on_topology_settled(2, &mut manager);
        assert_eq!(manager.submitted.len(), 2);
        let transaction = manager.submitted.last().unwrap();
        assert_eq!(transaction.serial, 2);
        assert_eq!(transaction.heads[0], HeadConfig::Disable { head: laptop });
        assert!(matches!(transaction.heads[1], HeadConfig::Enable(_)));

        session.handle_outcome(manager.last_id(), Outcome::Succeeded);
        assert_eq!(current_name(&session), Some("docked"));
        assert_eq!(*ran.borrow(), ["first", "fail", "third"]);
    }

    #[test]
    fn cancellation_after_topology_change_retries_exactly_once() {
        let (mut session, _) = session(vec![named("laptop", &["eDP-1"])]);
        let mut manager = FakeManager::default();
        connect(&mut session, "eDP-1");

        session.on_topology_settled(1, &mut manager);
        let first = manager.last_id();
        session.on_topology_settled(2, &mut manager);
        assert_eq!(manager.submitted.len(), 1);

        session.handle_outcome(first, Outcome::Cancelled);
        assert!(session.pending_profile().is_none());
        assert_eq!(manager.submitted.len(), 1);

        assert!(session.run_scheduled(&mut manager));
        assert_eq!(manager.submitted.len(), 2);
        assert_eq!(manager.submitted[1].serial, 2);
        assert!(!session.run_scheduled(&mut manager));
        assert_eq!(manager.submitted.len(), 2);
    }

    #[test]
    fn cancellation_without_topology_change_is_not_retried() {
        let (mut session, _) = session(vec![named("laptop", &["eDP-1"])]);
        let mut manager = FakeManager::default();
        connect(&mut session, "eDP-1");

        session.on_topology_settled(1, &mut manager);
        session.handle_outcome(manager.last_id(), Outcome::Cancelled);

        assert!(!session.run_scheduled(&mut manager));
        assert_eq!(manager.submitted.len(), 1);
        assert_eq!(session.pending_transactions(), 0);
    }

    #[test]
    fn failed_transaction_reports_not_applied() {
        let (mut session, ran) = session(vec![Profile::new(
            "laptop",
            vec![OutputConstraint::new("eDP-1")],
            vec!["never".to_owned()],
        )]);
        let mut manager = FakeManager::default();
        connect(&mut session, "eDP-1");
        session.on_topology_settled(1, &mut manager);

        let replies = Replies::default();
        session.switch("laptop", recorder(&replies), &mut manager);
        // Already pending: answered without a second transaction.
        assert_eq!(*replies.borrow(), [Ok(())]);
        assert_eq!(manager.submitted.len(), 1);

        session.handle_outcome(manager.last_id(), Outcome::Failed);
        assert!(session.pending_profile().is_none());
        assert!(session.current_profile().is_none());
        assert!(ran.borrow().is_empty());
    }

    #[test]
    fn switch_reports_not_found_and_not_matched() {
        let (mut session, _) = session(vec![named("laptop", &["eDP-1"]), named("docked", &["eDP-1", "DP-1"])]);
        let mut manager = FakeManager::default();
        connect(&mut session, "eDP-1");

        let replies = Replies::default();
        session.switch("missing", recorder(&replies), &mut manager);
        session.switch("docked", recorder(&replies), &mut manager);

        assert_eq!(
            *replies.borrow(),
            [Err(ControlError::ProfileNotFound), Err(ControlError::ProfileNotMatched)]
        );
        assert!(manager.submitted.is_empty());
    }

    #[test]
    fn switch_completes_after_the_outcome() {
        let (mut session, _) = session(vec![named("a", &["*"]), named("b", &["eDP-1"])]);
        let mut manager = FakeManager::default();
        connect(&mut session, "eDP-1");
        session.on_topology_settled(1, &mut manager);
        session.handle_outcome(manager.last_id(), Outcome::Succeeded);

        let replies = Replies::default();
        session.switch("b", recorder(&replies), &mut manager);
        assert!(replies.borrow().is_empty());

        session.handle_outcome(manager.last_id(), Outcome::Succeeded);
        assert_eq!(*replies.borrow(), [Ok(())]);
        assert_eq!(current_name(&session), Some("b"));

        // "a" still comes first, but a matching current profile is kept.
        session.on_topology_settled(2, &mut manager);
        assert_eq!(manager.submitted.len(), 2);
    }

    #[test]
    fn unresolvable_mode_reports_not_matched_without_submitting() {
        let profile = Profile::new(
            "hires",
            vec![OutputConstraint {
                mode: Some(ModeRequest {
                    width: 3840,
                    height: 2160,
                    refresh: None,
                }),
                ..OutputConstraint::new("eDP-1")
            }],
            Vec::new(),
        );
        let (mut session, _) = session(vec![profile]);
        let mut manager = FakeManager::default();
        connect(&mut session, "eDP-1");

        let replies = Replies::default();
        session.switch("hires", recorder(&replies), &mut manager);
        assert_eq!(*replies.borrow(), [Err(ControlError::ProfileNotMatched)]);
        assert!(manager.submitted.is_empty());
        assert!(session.pending_profile().is_none());
    }

    #[test]
    fn rejected_submission_reports_not_applied() {
        let (mut session, _) = session(vec![named("laptop", &["eDP-1"])]);
        let mut manager = FakeManager {
            reject: true,
            ..FakeManager::default()
        };
        connect(&mut session, "eDP-1");

        let replies = Replies::default();
        session.switch("laptop", recorder(&replies), &mut manager);
        assert_eq!(*replies.borrow(), [Err(ControlError::ProfileNotApplied)]);
        assert!(session.pending_profile().is_none());
        assert_eq!(session.pending_transactions(), 0);
    }

    #[test]
    fn reload_then_switch_uses_the_new_store() {
        let (mut session, _) = session(vec![named("old", &["eDP-1"])]);
        let mut manager = FakeManager::default();
        connect(&mut session, "eDP-1");
        session.on_topology_settled(1, &mut manager);
        session.handle_outcome(manager.last_id(), Outcome::Succeeded);

        let replies = Replies::default();
        let store = ProfileStore::new(vec![named("first", &["eDP-1"]), named("second", &["*"])]);
        session.reload(store, recorder(&replies), &mut manager);
        assert!(session.current_profile().is_none());
        assert_eq!(pending_name(&session), Some("first"));
        session.handle_outcome(manager.last_id(), Outcome::Succeeded);

        session.switch("second", recorder(&replies), &mut manager);
        session.switch("old", recorder(&replies), &mut manager);
        session.handle_outcome(manager.last_id(), Outcome::Succeeded);

        assert_eq!(
            *replies.borrow(),
            [Ok(()), Err(ControlError::ProfileNotFound), Ok(())]
        );
        assert_eq!(current_name(&session), Some("second"));
    }

    #[test]
    fn reload_without_match_reports_not_matched() {
        let (mut session, _) = session(Vec::new());
        let mut manager = FakeManager::default();
        connect(&mut session, "eDP-1");

        let replies = Replies::default();
        session.reload(ProfileStore::new(vec![named("docked", &["DP-1"])]), recorder(&replies), &mut manager);
        assert_eq!(*replies.borrow(), [Err(ControlError::ProfileNotMatched)]);
    }

    #[test]
    fn success_from_a_replaced_store_is_not_tracked() {
        let (mut session, _) = session(vec![named("laptop", &["eDP-1"])]);
        let mut manager = FakeManager::default();
        connect(&mut session, "eDP-1");
        session.on_topology_settled(1, &mut manager);
        let stale = manager.last_id();

        session.reload(ProfileStore::new(vec![named("laptop", &["eDP-1"])]), None, &mut manager);
        let fresh = manager.last_id();
        assert_ne!(stale, fresh);

        session.handle_outcome(stale, Outcome::Succeeded);
        assert!(session.current_profile().is_none());
        assert_eq!(pending_name(&session), Some("laptop"));

        session.handle_outcome(fresh, Outcome::Succeeded);
        let current = session.current_profile().unwrap();
        assert!(session.store().contains(current));
        assert!(session.pending_profile().is_none());
    }

    #[test]
    fn unknown_outcome_is_ignored() {
        let (mut session, _) = session(vec![named("laptop", &["eDP-1"])]);
        session.handle_outcome(TransactionId::new(42), Outcome::Succeeded);
        assert!(session.current_profile().is_none());
    }
}
