use adoptly_chat::ConversationSnapshot;
use adoptly_types::models::Message;

/// Name shown for the other participant.
pub fn counterpart_name(snapshot: &ConversationSnapshot) -> String {
    if snapshot.self_conversation {
        return "you (notes)".into();
    }
    match &snapshot.counterpart {
        Some(profile) => profile.username.clone().unwrap_or_else(|| profile.id.clone()),
        None => "unknown user".into(),
    }
}

pub fn message_line(snapshot: &ConversationSnapshot, message: &Message) -> String {
    let who = if message.sender_id == snapshot.me {
        "you".to_string()
    } else {
        match &snapshot.counterpart {
            Some(p) if p.id == message.sender_id => p.username.clone().unwrap_or_else(|| p.id.clone()),
            _ => message.sender_id.clone(),
        }
    };
    let mut line = format!("[{}] {}: {}", message.created_at.format("%H:%M"), who, message.text);
    if snapshot.seen_message_id.as_deref() == Some(message.id.as_str()) {
        line.push_str("  (Seen)");
    }
    line
}

/// One status line: connection, typing indicator, composer availability.
pub fn status_line(snapshot: &ConversationSnapshot) -> String {
    let mut parts = Vec::new();
    parts.push(if snapshot.connected { "connected" } else { "reconnecting..." }.to_string());
    if snapshot.peer_typing {
        parts.push(format!("{} is typing", counterpart_name(snapshot)));
    }
    if snapshot.self_conversation {
        parts.push("read-only".into());
    }
    parts.join(" | ")
}
