//! Questionnaire automaton and the per-session store that owns one automaton
//! per conversation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use dashmap::DashMap;
use tokio::sync::Mutex;

/// Session key used when the client does not identify its conversation.
pub const DEFAULT_SESSION: &str = "default";

/// Observable position of the automaton.  `Complete` is transient: recording
/// the last answer resets the state before the caller can observe it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    AskingQuestion(usize),
    Complete,
}

/// Outcome of recording a reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Turn {
    /// More questions remain; `next` is the index now being asked.
    Advanced { next: usize },
    /// Every question has an answer.  Pairs are `(question, answer)` in
    /// question order.  The state has already been reset.
    Completed { answers: Vec<(String, String)> },
}

#[derive(Clone, Debug)]
pub struct ConversationState {
    current: usize,
    questions: Arc<[String]>,
    answers: BTreeMap<usize, String>,
}

impl ConversationState {
    pub fn new(questions: Arc<[String]>) -> Self {
        Self {
            current: 0,
            questions,
            answers: BTreeMap::new(),
        }
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn questions(&self) -> &[String] {
        &self.questions
    }

    pub fn phase(&self) -> Phase {
        if self.current < self.questions.len() {
            Phase::AskingQuestion(self.current)
        } else {
            Phase::Complete
        }
    }

    pub fn current_question(&self) -> Option<&str> {
        self.questions.get(self.current).map(String::as_str)
    }

    pub fn answer(&self, index: usize) -> Option<&str> {
        self.answers.get(&index).map(String::as_str)
    }

    /// Record the reply obtained for the current question and advance.  On
    /// the final question the collected answers are returned and the state
    /// restarts at question 0.
    pub fn record_reply(&mut self, reply: impl Into<String>) -> Turn {
        if let Phase::AskingQuestion(i) = self.phase() {
            self.answers.insert(i, reply.into());
            self.current = i + 1;
        }
        match self.phase() {
            Phase::AskingQuestion(next) => Turn::Advanced { next },
            Phase::Complete => {
                let answers = self
                    .questions
                    .iter()
                    .enumerate()
                    .map(|(i, q)| (q.clone(), self.answers.get(&i).cloned().unwrap_or_default()))
                    .collect();
                self.reset();
                Turn::Completed { answers }
            }
        }
    }

    pub fn reset(&mut self) {
        self.current = 0;
        self.answers.clear();
    }
}

struct SessionEntry {
    state: Arc<Mutex<ConversationState>>,
    last_active: Instant,
}

/// Conversation states keyed by session identifier.  Each state sits behind
/// its own async mutex; a request holds it for the whole turn so turns on one
/// session are serialised while distinct sessions run in parallel.
///
/// The store holds at most `max_sessions` entries: admitting a new session
/// at capacity evicts the least recently active one that has no turn in
/// flight.
#[derive(Clone)]
pub struct SessionStore {
    questions: Arc<[String]>,
    sessions: Arc<DashMap<String, SessionEntry, RandomState>>,
    max_sessions: usize,
}

pub const DEFAULT_MAX_SESSIONS: usize = 10_000;

impl SessionStore {
    pub fn new(questions: Vec<String>) -> Self {
        Self {
            questions: questions.into(),
            sessions: Arc::new(DashMap::with_hasher(RandomState::new())),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    pub fn questions(&self) -> &[String] {
        &self.questions
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// State a session starts from, without registering it.
    pub fn fresh_state(&self) -> ConversationState {
        ConversationState::new(self.questions.clone())
    }

    /// Handle to the state for `id` if the session already exists.
    pub fn existing(&self, id: &str) -> Option<Arc<Mutex<ConversationState>>> {
        let mut entry = self.sessions.get_mut(id)?;
        entry.last_active = Instant::now();
        Some(entry.state.clone())
    }

    /// Handle to the state for `id`, created at question 0 on first use.
    pub fn session(&self, id: &str) -> Arc<Mutex<ConversationState>> {
        if let Some(state) = self.existing(id) {
            return state;
        }
        if self.sessions.len() >= self.max_sessions {
            self.evict_oldest_idle();
        }
        let mut entry = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| SessionEntry {
                state: Arc::new(Mutex::new(ConversationState::new(self.questions.clone()))),
                last_active: Instant::now(),
            });
        entry.last_active = Instant::now();
        entry.state.clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn evict_oldest_idle(&self) {
        let oldest = self
            .sessions
            .iter()
            .filter(|entry| Arc::strong_count(&entry.state) == 1)
            .min_by_key(|entry| entry.last_active)
            .map(|entry| entry.key().clone());
        if let Some(id) = oldest {
            // Skip the eviction if a turn picked the session up in the meantime.
            self.sessions
                .remove_if(&id, |_, entry| Arc::strong_count(&entry.state) == 1);
        }
    }

    /// Drop sessions untouched for longer than `max_idle`.  Sessions with a
    /// turn in flight are kept.  Returns the number removed.
    pub fn prune_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| {
            entry.last_active.elapsed() < max_idle || Arc::strong_count(&entry.state) > 1
        });
        before.saturating_sub(self.sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn questions(qs: &[&str]) -> Arc<[String]> {
        qs.iter().map(|q| q.to_string()).collect::<Vec<_>>().into()
    }

    #[test]
    fn starts_at_first_question() {
        let state = ConversationState::new(questions(&["Q1", "Q2"]));
        assert_eq!(state.phase(), Phase::AskingQuestion(0));
        assert_eq!(state.current_question(), Some("Q1"));
        assert_eq!(state.answer(0), None);
    }

    #[test]
    fn needs_exactly_n_turns_to_complete() {
        let mut state = ConversationState::new(questions(&["Q1", "Q2", "Q3"]));
        assert_eq!(state.record_reply("a1"), Turn::Advanced { next: 1 });
        assert_eq!(state.answer(0), Some("a1"));
        assert_eq!(state.record_reply("a2"), Turn::Advanced { next: 2 });
        match state.record_reply("a3") {
            Turn::Completed { answers } => {
                let got: Vec<_> = answers.iter().map(|(_, a)| a.as_str()).collect();
                assert_eq!(got, vec!["a1", "a2", "a3"]);
                assert_eq!(answers[2].0, "Q3");
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn completion_resets_cursor_and_answers() {
        let mut state = ConversationState::new(questions(&["Q1"]));
        assert!(matches!(state.record_reply("only"), Turn::Completed { .. }));
        assert_eq!(state.phase(), Phase::AskingQuestion(0));
        assert_eq!(state.answer(0), None);
        assert_eq!(state.questions().len(), 1);
        // the next cycle behaves like the first one
        assert!(matches!(state.record_reply("again"), Turn::Completed { .. }));
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let store = SessionStore::new(vec!["Q1".into(), "Q2".into()]);
        let a = store.session("a");
        let b = store.session("b");
        a.lock().await.record_reply("x");
        assert_eq!(a.lock().await.current_index(), 1);
        assert_eq!(b.lock().await.current_index(), 0);
        // same id yields the same state
        assert_eq!(store.session("a").lock().await.current_index(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn lookup_does_not_create_sessions() {
        let store = SessionStore::new(vec!["Q1".into()]);
        assert!(store.existing("ghost").is_none());
        assert!(store.is_empty());
        assert_eq!(store.fresh_state().current_index(), 0);
        let created = store.session("real");
        assert!(Arc::ptr_eq(&created, &store.existing("real").unwrap()));
    }

    #[test]
    fn capacity_evicts_least_recently_active_idle_session() {
        let store = SessionStore::new(vec!["Q1".into()]).with_max_sessions(3);
        let busy = store.session("busy");
        drop(store.session("old"));
        std::thread::sleep(Duration::from_millis(5));
        drop(store.session("recent"));
        assert_eq!(store.len(), 3);

        drop(store.session("new"));
        assert_eq!(store.len(), 3);
        assert!(store.existing("old").is_none());
        assert!(store.existing("busy").is_some());
        assert!(store.existing("recent").is_some());
        drop(busy);
    }

    #[test]
    fn full_store_of_busy_sessions_still_admits() {
        let store = SessionStore::new(vec!["Q1".into()]).with_max_sessions(1);
        let _held = store.session("a");
        let _other = store.session("b");
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn prune_keeps_recent_and_busy_sessions() {
        let store = SessionStore::new(vec!["Q1".into()]);
        let held = store.session("busy");
        drop(store.session("idle"));
        assert_eq!(store.prune_idle(Duration::ZERO), 1);
        assert_eq!(store.len(), 1);
        drop(held);
        assert_eq!(store.prune_idle(Duration::from_secs(3600)), 0);
        assert_eq!(store.prune_idle(Duration::ZERO), 1);
        assert!(store.is_empty());
    }
}
