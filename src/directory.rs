//! 세션 디렉터리
//!
//! 살아 있는 세션의 이름 → 핸들. 이름은 항상 유일.
//! 등록/해제는 DashMap entry API 로 원자적으로 처리.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// 세션 식별자 (연결마다 새로 발급)
pub type SessionId = u64;

/// 등록된 세션에 줄을 보내는 핸들
///
/// 실제 소켓 쓰기는 세션의 writer 태스크 하나만 함.
/// 대기열이 가득 차면 그 세션은 끊어야 할 세션으로 표시됨.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    name: String,
    tx: mpsc::Sender<String>,
    overflow: Arc<Notify>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 줄 하나 전송, 세션이 닫혔거나 대기열이 가득 찼으면 false
    pub fn send(&self, line: impl Into<String>) -> bool {
        match self.tx.try_send(line.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("{} 송신 대기열 가득 참, 세션 종료 요청", self.name);
                self.overflow.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// 대기열이 넘칠 때까지 대기
    pub async fn overflowed(&self) {
        self.overflow.notified().await
    }
}

/// 이름을 주소 지정 가능한 한 토큰으로 정리
///
/// 공백, `,`, `:` 는 `_` 로 바꿈. 맨 앞 `/` 도 `_` (명령 줄과 헷갈리지 않게).
/// 비어 있으면 None.
pub fn sanitize_name(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        trimmed
            .chars()
            .enumerate()
            .map(|(i, c)| match c {
                c if c.is_whitespace() || c == ',' || c == ':' => '_',
                '/' if i == 0 => '_',
                c => c,
            })
            .collect(),
    )
}

/// 세션 디렉터리
#[derive(Debug, Default)]
pub struct SessionDirectory {
    sessions: DashMap<String, SessionHandle>,
    next_id: AtomicU64,
}

impl SessionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// 이름 등록, 실패하지 않음
    ///
    /// 이미 쓰이는 이름이면 `<name>_<unix millis>` 로, 그것도 쓰이면 숫자를 올려가며 시도
    pub fn register(&self, proposed: &str, tx: mpsc::Sender<String>) -> SessionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut candidate = proposed.to_string();
        let mut stamp: Option<u128> = None;

        loop {
            match self.sessions.entry(candidate.clone()) {
                Entry::Vacant(slot) => {
                    let handle = SessionHandle {
                        id,
                        name: candidate,
                        tx,
                        overflow: Arc::new(Notify::new()),
                    };
                    slot.insert(handle.clone());
                    return handle;
                }
                Entry::Occupied(_) => {
                    let next = match stamp {
                        Some(s) => s + 1,
                        None => unix_millis(),
                    };
                    stamp = Some(next);
                    candidate = format!("{}_{}", proposed, next);
                    debug!("이름 충돌: {} → {} 시도", proposed, candidate);
                }
            }
        }
    }

    /// 세션 해제
    ///
    /// 같은 이름을 나중에 다른 세션이 가져갔으면 건드리지 않음
    pub fn unregister(&self, handle: &SessionHandle) -> bool {
        self.sessions
            .remove_if(&handle.name, |_, current| current.id == handle.id)
            .is_some()
    }

    pub fn lookup(&self, name: &str) -> Option<SessionHandle> {
        self.sessions.get(name).map(|entry| entry.value().clone())
    }

    /// 현재 이름 목록 (정렬된 스냅샷)
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// 이름으로 한 세션에 전송, 받을 세션이 없으면 false
    pub fn send_to(&self, name: &str, line: &str) -> bool {
        match self.sessions.get(name) {
            Some(entry) => entry.value().send(line),
            None => false,
        }
    }

    /// `exclude` 를 뺀 모든 세션에 전송
    pub fn broadcast_except(&self, exclude: Option<SessionId>, line: &str) {
        for entry in self.sessions.iter() {
            let handle = entry.value();
            if Some(handle.id) != exclude {
                handle.send(line);
            }
        }
    }

    /// `/userlist a,b,c`
    pub fn userlist_line(&self) -> String {
        format!("/userlist {}", self.list_names().join(","))
    }

    /// 입장 알림 + 모든 세션에 디렉터리 갱신
    pub fn announce_join(&self, handle: &SessionHandle) {
        self.broadcast_except(Some(handle.id), &format!("{} joined the chat", handle.name));
        self.broadcast_except(None, &self.userlist_line());
    }

    /// 퇴장 알림 + 남은 세션에 디렉터리 갱신 (해제 후 호출)
    pub fn announce_leave(&self, handle: &SessionHandle) {
        self.broadcast_except(Some(handle.id), &format!("{} left the chat", handle.name));
        self.broadcast_except(None, &self.userlist_line());
    }
}

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
