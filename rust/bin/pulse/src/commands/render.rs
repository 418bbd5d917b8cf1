//! Terminal rendering of published view state.

use anyhow::Result;
use serde::Serialize;

use pulse_social::state::{ChatThread, NotificationList, PostList};
use pulse_social::{Media, StoryGroup, StoryKind};

fn json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn posts(list: &PostList, json_output: bool) -> Result<()> {
    if json_output {
        return json(list);
    }
    if let Some(err) = &list.status.error {
        println!("! {}", err.message());
    }
    println!("{:<38} {:<14} {:>5} {:>5} {:>5}  {}", "ID", "AUTHOR", "LIKES", "CMTS", "SHARE", "CONTENT");
    for p in &list.items {
        let media = match &p.media {
            Some(Media::Image(_)) => " [image]",
            Some(Media::Video(_)) => " [video]",
            None => "",
        };
        println!(
            "{:<38} {:<14} {:>4}{} {:>5} {:>5}  {}{}",
            p.id,
            p.author.username,
            p.likes,
            if p.is_liked { "*" } else { " " },
            p.comments.len(),
            p.shares,
            truncate(&p.content, 40),
            media,
        );
    }
    if let Some(notice) = &list.status.notice {
        println!("({})", notice.message());
    }
    Ok(())
}

pub fn tray(groups: &[StoryGroup], json_output: bool) -> Result<()> {
    if json_output {
        return json(&groups);
    }
    for g in groups {
        let kinds: Vec<&str> = g
            .stories
            .iter()
            .map(|s| match s.kind {
                StoryKind::Image { .. } => "image",
                StoryKind::Text { .. } => "text",
            })
            .collect();
        println!(
            "{} {:<14} {} ({})",
            if g.has_unviewed { "●" } else { "○" },
            g.author.username,
            g.stories.len(),
            kinds.join(", ")
        );
    }
    Ok(())
}

pub fn chat(thread: &ChatThread, me: &str, json_output: bool) -> Result<()> {
    if json_output {
        return json(thread);
    }
    let peer = thread.peer.as_ref().map_or(thread.peer_id.as_str(), |p| p.username.as_str());
    println!("-- chat with {} --", peer);
    for m in &thread.messages {
        let who = if m.sender_id == me { "you" } else { peer };
        println!("{} {:>8}: {}", m.created_at.format("%H:%M"), who, m.text);
    }
    Ok(())
}

pub fn notifications(list: &NotificationList, json_output: bool) -> Result<()> {
    if json_output {
        return json(list);
    }
    println!("{} unread", list.unread);
    for n in &list.items {
        println!(
            "{} {:?} from {}",
            if n.read { " " } else { "•" },
            n.kind,
            n.actor.username
        );
    }
    Ok(())
}

fn truncate(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.chars().count() <= max {
        return line.to_string();
    }
    let cut: String = line.chars().take(max.saturating_sub(1)).collect();
    format!("{}…", cut)
}
