//! 대화 스레드 저장소 - 스레드 ID별 상태 격리
//!
//! 어댑터마다 스레드에 붙이는 상태가 다릅니다.
//! (로컬/Kendra/Vertex: 질문-답변 기록, Bedrock: sessionId, OpenAI: 직전 response id)

use std::collections::HashMap;
use std::sync::Mutex;

/// 새 스레드 ID (UUID v4)
pub fn new_thread_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 한 번의 질문-답변
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

/// 스레드 ID → 상태
#[derive(Debug)]
pub struct ThreadStore<T> {
    threads: Mutex<HashMap<String, T>>,
}

impl<T> Default for ThreadStore<T> {
    fn default() -> Self {
        Self {
            threads: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> ThreadStore<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, thread_id: &str) -> Option<T> {
        self.lock().get(thread_id).cloned()
    }

    pub fn set(&self, thread_id: &str, state: T) {
        self.lock().insert(thread_id.to_string(), state);
    }

    pub fn remove(&self, thread_id: &str) -> Option<T> {
        self.lock().remove(thread_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, T>> {
        // 갱신 중 패닉이 나도 맵 자체는 일관된 상태
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 질문-답변 기록 스레드
pub type History = ThreadStore<Vec<Turn>>;

impl ThreadStore<Vec<Turn>> {
    /// 기록 조회 (없으면 빈 기록)
    pub fn turns(&self, thread_id: &str) -> Vec<Turn> {
        self.get(thread_id).unwrap_or_default()
    }

    /// 턴 추가 (최근 `max_turns`개만 유지)
    pub fn push_turn(&self, thread_id: &str, turn: Turn, max_turns: usize) {
        let mut threads = self.lock();
        let turns = threads.entry(thread_id.to_string()).or_default();
        turns.push(turn);
        if turns.len() > max_turns {
            let excess = turns.len() - max_turns;
            turns.drain(..excess);
        }
    }
}

/// 프롬프트용 이전 대화 블록
pub fn render_history(turns: &[Turn]) -> String {
    turns
        .iter()
        .map(|t| format!("User: {}\nAssistant: {}", t.question, t.answer))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(q: &str) -> Turn {
        Turn {
            question: q.to_string(),
            answer: format!("answer to {}", q),
        }
    }

    #[test]
    fn test_threads_are_isolated() {
        let history = History::new();
        history.push_turn("t1", turn("first"), 10);
        history.push_turn("t2", turn("other"), 10);
        history.push_turn("t1", turn("second"), 10);

        let t1: Vec<String> = history.turns("t1").into_iter().map(|t| t.question).collect();
        assert_eq!(t1, vec!["first", "second"]);
        assert_eq!(history.turns("t2").len(), 1);
        assert!(history.turns("t3").is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let history = History::new();
        for i in 0..5 {
            history.push_turn("t", turn(&i.to_string()), 3);
        }
        let questions: Vec<String> = history.turns("t").into_iter().map(|t| t.question).collect();
        assert_eq!(questions, vec!["2", "3", "4"]);
    }

    #[test]
    fn test_fresh_thread_ids_differ() {
        assert_ne!(new_thread_id(), new_thread_id());
    }

    #[test]
    fn test_session_store() {
        let sessions: ThreadStore<String> = ThreadStore::new();
        sessions.set("t1", "session-a".to_string());
        assert_eq!(sessions.get("t1").as_deref(), Some("session-a"));
        assert_eq!(sessions.get("t2"), None);
        assert_eq!(sessions.remove("t1").as_deref(), Some("session-a"));
        assert!(sessions.is_empty());
    }

    #[test]
    fn test_render_history() {
        let rendered = render_history(&[turn("a"), turn("b")]);
        assert_eq!(
            rendered,
            "User: a\nAssistant: answer to a\n\nUser: b\nAssistant: answer to b"
        );
    }
}
