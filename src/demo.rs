//! Demo handler group served by `socket-rpc serve`.
//!
//! | Event       | Wrappers                       | Behavior                          |
//! |-------------|--------------------------------|-----------------------------------|
//! | `ping`      |                                | `"pong"`                          |
//! | `echo`      |                                | returns the payload               |
//! | `login`     |                                | binds a [`User`] to the session   |
//! | `whoami`    | `require_auth`                 | returns the session's user        |
//! | `chat.send` | `require_auth`, `broadcast`    | posts to every other connection   |

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RpcError;
use crate::protocol::RpcEvent;
use crate::server::{broadcast, require_auth, typed, BroadcastOptions, Handler, HandlerGroup, User};

/// Event name chat posts are broadcast on.
pub const CHAT_MESSAGE_EVENT: &str = "chat.message";

/// `ping` → `"pong"`.
#[derive(Debug)]
pub struct Ping;

impl RpcEvent for Ping {
    const NAME: &'static str = "ping";
    type Request = Value;
    type Response = String;
}

/// `echo` → the request payload.
#[derive(Debug)]
pub struct Echo;

impl RpcEvent for Echo {
    const NAME: &'static str = "echo";
    type Request = Value;
    type Response = Value;
}

/// `login` → binds the user to the connection's session.
#[derive(Debug)]
pub struct Login;

impl RpcEvent for Login {
    const NAME: &'static str = "login";
    type Request = User;
    type Response = User;
}

/// `whoami` → the authenticated user.
#[derive(Debug)]
pub struct WhoAmI;

impl RpcEvent for WhoAmI {
    const NAME: &'static str = "whoami";
    type Request = Value;
    type Response = User;
}

/// `chat.send` request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSend {
    /// Message text.
    pub text: String,
}

/// A chat post as seen by the sender and every recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPost {
    /// Id of the posting user.
    pub from: String,
    /// Message text.
    pub text: String,
}

/// `chat.send` → a [`ChatPost`], also broadcast on [`CHAT_MESSAGE_EVENT`].
#[derive(Debug)]
pub struct Chat;

impl RpcEvent for Chat {
    const NAME: &'static str = "chat.send";
    type Request = ChatSend;
    type Response = ChatPost;
}

/// The demo registration table.
#[derive(Debug, Default)]
pub struct DemoHandlers;

impl HandlerGroup for DemoHandlers {
    fn handlers(&self) -> Vec<(String, Handler)> {
        let ping = typed::<Ping, _, _>(|_, _| async { Ok("pong".to_string()) });

        let echo = typed::<Echo, _, _>(|_, payload| async move { Ok(payload) });

        let login = typed::<Login, _, _>(|ctx, user| async move {
            if user.id.is_empty() {
                return Err(RpcError::invalid_payload(Login::NAME, "user id must not be empty"));
            }
            log::info!("[Dispatch] {} logged in as {}", ctx.socket().id(), user.id);
            ctx.session().set_user(Some(user.clone()));
            Ok(user)
        });

        let whoami = require_auth(typed::<WhoAmI, _, _>(|ctx, _| async move {
            ctx.user().ok_or_else(RpcError::unauthorized)
        }));

        let chat = typed::<Chat, _, _>(|ctx, message| async move {
            let from = ctx.user().map(|user| user.id).ok_or_else(RpcError::unauthorized)?;
            Ok(ChatPost {
                from,
                text: message.text,
            })
        });
        let chat = require_auth(broadcast(BroadcastOptions::new().event(CHAT_MESSAGE_EVENT))(chat));

        vec![
            (Ping::NAME.to_string(), ping),
            (Echo::NAME.to_string(), echo),
            (Login::NAME.to_string(), login),
            (WhoAmI::NAME.to_string(), whoami),
            (Chat::NAME.to_string(), chat),
        ]
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::constants::ERR_UNAUTHORIZED;
    use crate::server::test_support::{connect, registry_with};
    use crate::server::Router;

    fn router() -> Router {
        let mut router = Router::new();
        router.register_group(&DemoHandlers);
        router
    }

    #[test]
    fn test_registers_every_event() {
        assert_eq!(
            router().events(),
            vec!["chat.send", "echo", "login", "ping", "whoami"]
        );
    }

    #[tokio::test]
    async fn test_login_then_chat() {
        let registry = registry_with(router(), 1024);
        let (_a, mut alice) = connect(&registry).await;
        let (_b, mut bob) = connect(&registry).await;

        alice.request("chat.send", "k0", &json!({"text": "hi"}), 1024).await;
        let err = alice.recv().await.envelope.into_result().unwrap_err();
        assert_eq!(err.code, ERR_UNAUTHORIZED);

        alice.request("login", "k1", &json!({"id": "alice"}), 1024).await;
        assert_eq!(alice.recv().await.envelope.into_result().unwrap(), json!({"id": "alice"}));

        alice.request("chat.send", "k2", &json!({"text": "hi"}), 1024).await;
        let post = json!({"from": "alice", "text": "hi"});
        assert_eq!(alice.recv().await.envelope.into_result().unwrap(), post);

        let seen = bob.recv().await;
        assert!(seen.broadcast);
        assert_eq!(seen.event, CHAT_MESSAGE_EVENT);
        assert_eq!(seen.envelope.into_result().unwrap(), post);
    }

    #[tokio::test]
    async fn test_login_rejects_empty_id() {
        let registry = registry_with(router(), 1024);
        let (_socket, mut peer) = connect(&registry).await;
        peer.request("login", "k1", &json!({"id": ""}), 1024).await;
        let err = peer.recv().await.envelope.into_result().unwrap_err();
        assert_eq!(err.status_code, Some(400));
    }
}
