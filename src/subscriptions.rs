//! Notification subscriptions: method name to subscribed agents.

use std::collections::{BTreeSet, HashMap};

use crate::protocol::AgentKind;

/// Many-to-many mapping of notification methods to subscribers.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionRegistry {
    by_method: HashMap<String, BTreeSet<AgentKind>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe an agent. Returns false if it was already subscribed.
    pub fn subscribe(&mut self, method: impl Into<String>, agent: AgentKind) -> bool {
        self.by_method.entry(method.into()).or_default().insert(agent)
    }

    /// Unsubscribe an agent. Returns false if it was not subscribed.
    pub fn unsubscribe(&mut self, method: &str, agent: AgentKind) -> bool {
        let Some(subscribers) = self.by_method.get_mut(method) else {
            return false;
        };
        let removed = subscribers.remove(&agent);
        if subscribers.is_empty() {
            self.by_method.remove(method);
        }
        removed
    }

    /// Drop every subscription held by an agent. Returns how many were removed.
    pub fn unsubscribe_all(&mut self, agent: AgentKind) -> usize {
        let mut removed = 0;
        self.by_method.retain(|_, subscribers| {
            if subscribers.remove(&agent) {
                removed += 1;
            }
            !subscribers.is_empty()
        });
        removed
    }

    /// Current subscribers of a method.
    pub fn subscribers(&self, method: &str) -> Vec<AgentKind> {
        self.by_method
            .get(method)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Methods an agent is subscribed to.
    pub fn subscriptions_of(&self, agent: AgentKind) -> Vec<String> {
        let mut methods: Vec<String> = self
            .by_method
            .iter()
            .filter(|(_, subscribers)| subscribers.contains(&agent))
            .map(|(method, _)| method.clone())
            .collect();
        methods.sort();
        methods
    }

    /// Methods with at least one subscriber.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.by_method.keys().cloned().collect();
        methods.sort();
        methods
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.by_method.clear();
    }
}
