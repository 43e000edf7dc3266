//! Built-in server and channel catalogue.
//!
//! Channels are static configuration: the mesh only ever sees channel ids.

use serde::{Deserialize, Serialize};

use crate::Channel;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub icon: String,
    pub channels: Vec<Channel>,
}

pub fn default_servers() -> Vec<Server> {
    vec![
        Server {
            id: "1".to_owned(),
            name: "General Community".to_owned(),
            icon: "https://picsum.photos/id/10/48/48".to_owned(),
            channels: vec![
                Channel::text("general", "general"),
                Channel::text("resources", "resources"),
                Channel::voice("voice-general", "General Voice"),
            ],
        },
        Server {
            id: "2".to_owned(),
            name: "TypeScript Mastery".to_owned(),
            icon: "https://picsum.photos/id/20/48/48".to_owned(),
            channels: vec![
                Channel::text("ts-chat", "typescript-help"),
                Channel::text("react-stuff", "react-patterns"),
            ],
        },
        Server {
            id: "3".to_owned(),
            name: "Tailwind Wizards".to_owned(),
            icon: "https://picsum.photos/id/30/48/48".to_owned(),
            channels: vec![
                Channel::text("css-tricks", "css-wizardry"),
                Channel::text("showcase", "showcase"),
            ],
        },
    ]
}

pub fn find_channel<'a>(servers: &'a [Server], channel_id: &str) -> Option<&'a Channel> {
    servers
        .iter()
        .flat_map(|server| server.channels.iter())
        .find(|channel| channel.id == channel_id)
}
