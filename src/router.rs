//! 명령 라우터
//!
//! 우선순위: `/quit` → `/users` → `/msg <name> <text>` → `/private <name>` → 공개 메시지

use std::sync::Arc;

use tracing::{debug, info};

use crate::directory::{SessionDirectory, SessionHandle};

/// 클라이언트가 보낸 한 줄
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// 세션 종료
    Quit,
    /// 디렉터리 요청
    Users,
    /// 귓속말
    Direct { to: &'a str, text: &'a str },
    /// 귓속말 대화 시작 알림 (응답 없음)
    Private { to: &'a str },
    /// 형식이 틀린 명령 (무시)
    Malformed(&'a str),
    /// 공개 메시지
    Public(&'a str),
}

impl<'a> Command<'a> {
    /// 명령어 매칭은 줄 그대로 (앞뒤 공백을 떼지 않음)
    pub fn parse(line: &'a str) -> Self {
        if line.eq_ignore_ascii_case("/quit") {
            return Command::Quit;
        }
        if line.eq_ignore_ascii_case("/users") {
            return Command::Users;
        }

        if let Some(rest) = strip_command(line, "/msg") {
            let rest = rest.trim_start();
            return match rest.split_once(char::is_whitespace) {
                Some((to, text)) => Command::Direct { to, text },
                None if !rest.is_empty() => Command::Direct { to: rest, text: "" },
                None => Command::Malformed(line),
            };
        }

        if let Some(rest) = strip_command(line, "/private") {
            return match rest.split_whitespace().next() {
                Some(to) => Command::Private { to },
                None => Command::Malformed(line),
            };
        }

        Command::Public(line)
    }
}

/// `/msg` 처럼 명령어 뒤가 끝이거나 공백일 때만 나머지를 돌려줌
fn strip_command<'a>(line: &'a str, command: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(command)?;
    if rest.is_empty() || rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        None
    }
}

/// 처리 후 세션이 할 일
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Continue,
    Quit,
}

/// 명령을 디렉터리에 대해 실행
#[derive(Debug, Clone)]
pub struct CommandRouter {
    directory: Arc<SessionDirectory>,
}

impl CommandRouter {
    pub fn new(directory: Arc<SessionDirectory>) -> Self {
        Self { directory }
    }

    pub fn dispatch(&self, session: &SessionHandle, line: &str) -> Dispatch {
        match Command::parse(line) {
            Command::Quit => return Dispatch::Quit,
            Command::Users => {
                session.send(self.directory.userlist_line());
            }
            Command::Direct { to, text } => {
                let line = format!("/private {}: {}", session.name(), text);
                // 없는 사용자에게 보낸 귓속말은 조용히 버림
                if !self.directory.send_to(to, &line) {
                    debug!("귓속말 대상 없음: {} → {}", session.name(), to);
                }
            }
            Command::Private { to } => {
                debug!("{} 가 {} 와 귓속말 시작", session.name(), to);
            }
            Command::Malformed(raw) => {
                debug!("잘못된 명령 무시: {:?} from {}", raw, session.name());
            }
            Command::Public(text) => {
                info!("{}: {}", session.name(), text);
                self.directory
                    .broadcast_except(Some(session.id()), &format!("{}: {}", session.name(), text));
            }
        }
        Dispatch::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_priority() {
        assert_eq!(Command::parse("/quit"), Command::Quit);
        assert_eq!(Command::parse("/QUIT"), Command::Quit);
        assert_eq!(Command::parse("/users"), Command::Users);
        assert_eq!(
            Command::parse("/msg bob hello there"),
            Command::Direct {
                to: "bob",
                text: "hello there"
            }
        );
        assert_eq!(Command::parse("/msg bob"), Command::Direct { to: "bob", text: "" });
        assert_eq!(Command::parse("/private bob"), Command::Private { to: "bob" });
        assert_eq!(Command::parse("/msg"), Command::Malformed("/msg"));
        assert_eq!(Command::parse("hello /quit"), Command::Public("hello /quit"));
        // 명령어 접두사만 같은 단어는 공개 메시지
        assert_eq!(Command::parse("/msgbox"), Command::Public("/msgbox"));
        assert_eq!(Command::parse("/quitting"), Command::Public("/quitting"));
        // 공백이 붙으면 명령이 아님
        assert_eq!(Command::parse(" /Quit "), Command::Public(" /Quit "));
        assert_eq!(Command::parse("/users "), Command::Public("/users "));
    }

    #[test]
    fn test_descriptor_body_passes_through_direct() {
        let line = "/msg bob File bob 10.0.0.2 40000 a.txt 12";
        assert_eq!(
            Command::parse(line),
            Command::Direct {
                to: "bob",
                text: "File bob 10.0.0.2 40000 a.txt 12"
            }
        );
    }

    #[test]
    fn test_direct_reaches_only_recipient() {
        let directory = Arc::new(SessionDirectory::new());
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, mut rx_b) = mpsc::channel(16);
        let (tx_c, mut rx_c) = mpsc::channel(16);
        let alice = directory.register("alice", tx_a);
        directory.register("bob", tx_b);
        directory.register("charlie", tx_c);

        let router = CommandRouter::new(Arc::clone(&directory));
        assert_eq!(router.dispatch(&alice, "/msg bob hello"), Dispatch::Continue);

        assert_eq!(rx_b.try_recv().unwrap(), "/private alice: hello");
        assert!(rx_c.try_recv().is_err());
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_unknown_recipient_is_dropped() {
        let directory = Arc::new(SessionDirectory::new());
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let alice = directory.register("alice", tx_a);

        let router = CommandRouter::new(directory);
        assert_eq!(router.dispatch(&alice, "/msg ghost boo"), Dispatch::Continue);
        assert!(rx_a.try_recv().is_err());
    }

    #[test]
    fn test_users_and_quit() {
        let directory = Arc::new(SessionDirectory::new());
        let (tx_a, mut rx_a) = mpsc::channel(16);
        let (tx_b, _rx_b) = mpsc::channel(16);
        let alice = directory.register("alice", tx_a);
        directory.register("bob", tx_b);

        let router = CommandRouter::new(directory);
        router.dispatch(&alice, "/users");
        assert_eq!(rx_a.try_recv().unwrap(), "/userlist alice,bob");
        assert_eq!(router.dispatch(&alice, "/Quit"), Dispatch::Quit);
    }
}
