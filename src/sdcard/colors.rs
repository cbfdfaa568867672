//! Display colors for imported channels.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const PALETTE: [&str; 12] = [
    "#1f77b4", "#ff7f0e", "#2ca02c", "#d62728", "#9467bd", "#8c564b", "#e377c2", "#7f7f7f",
    "#bcbd22", "#17becf", "#393b79", "#637939",
];

/// Colors assigned to channel names, in the order the names were first seen.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelColorMap {
    order: Vec<String>,
    colors: HashMap<String, String>,
}

impl ChannelColorMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Color of `channel`, assigning the next palette entry on first sight.
    pub fn color_for(&mut self, channel: &str) -> &str {
        if !self.colors.contains_key(channel) {
            let color = PALETTE[self.order.len() % PALETTE.len()].to_string();
            self.order.push(channel.to_string());
            self.colors.insert(channel.to_string(), color);
        }
        self.colors.get(channel).map(String::as_str).unwrap_or(PALETTE[0])
    }

    /// Color of `channel` if it has one.
    pub fn get(&self, channel: &str) -> Option<&str> {
        self.colors.get(channel).map(String::as_str)
    }

    /// `(channel, color)` pairs in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order
            .iter()
            .filter_map(|name| self.colors.get(name).map(|c| (name.as_str(), c.as_str())))
    }

    /// Number of channels with a color.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no channel has a color yet.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
