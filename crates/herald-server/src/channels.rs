//! Channels served by the `herald` binary.

use async_trait::async_trait;
use herald_core::{
    Channel, ChannelError, ChannelRouter, Join, Reply, RouterError, Socket, StopReason,
};
use serde_json::{json, Value};
use tracing::debug;

/// A chat room on `rooms:*`.
///
/// Joining assigns the `user` from the join payload. `new_msg` events are
/// broadcast to the room, `ping` is answered with its own payload.
#[derive(Debug, Default)]
pub struct RoomChannel;

#[async_trait]
impl Channel for RoomChannel {
    async fn join(
        &mut self,
        topic: &str,
        payload: Value,
        socket: &mut Socket,
    ) -> Result<Join, ChannelError> {
        let user = payload
            .get("user")
            .and_then(Value::as_str)
            .unwrap_or("anonymous")
            .to_string();
        if user.is_empty() {
            return Ok(Join::error("user must not be empty"));
        }

        debug!(topic = %topic, user = %user, "Room join");
        socket.assign("user", Value::String(user));
        socket.send_info(json!({ "after_join": true }));
        Ok(Join::ok())
    }

    async fn handle_in(
        &mut self,
        event: &str,
        payload: Value,
        socket: &mut Socket,
    ) -> Result<Reply, ChannelError> {
        match event {
            "new_msg" => {
                let body = payload
                    .get("body")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ChannelError::new("new_msg without body"))?;
                let user = socket.get_assign("user").cloned().unwrap_or(Value::Null);
                socket
                    .broadcast("new_msg", json!({ "user": user, "body": body }))
                    .await;
                Ok(Reply::ok(json!({})))
            }
            "ping" => Ok(Reply::ok(payload)),
            _ => Ok(Reply::error(json!({ "reason": "unknown event" }))),
        }
    }

    async fn handle_info(
        &mut self,
        message: Value,
        socket: &mut Socket,
    ) -> Result<Reply, ChannelError> {
        if message.get("after_join").is_some() {
            let user = socket.get_assign("user").cloned().unwrap_or(Value::Null);
            socket.push("welcome", json!({ "user": user, "topic": socket.topic() }));
        }
        Ok(Reply::NoReply)
    }

    async fn terminate(&mut self, reason: &StopReason, socket: &mut Socket) {
        debug!(topic = %socket.topic(), reason = %reason, "Room closed");
    }
}

/// The route table of the `herald` binary.
///
/// # Errors
///
/// Returns an error if a pattern is invalid.
pub fn router() -> Result<ChannelRouter, RouterError> {
    ChannelRouter::new().channel("rooms:*", || RoomChannel)
}
