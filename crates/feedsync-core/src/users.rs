use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::models::UserInfo;

/// Session-scoped profile cache. Lives and dies with the feed session.
#[derive(Debug, Clone, Default)]
pub struct UserCache {
    users: Arc<RwLock<HashMap<String, UserInfo>>>,
}

impl UserCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&self, info: UserInfo) {
        self.users.write().insert(info.user_id.clone(), info);
    }

    pub fn get(&self, user_id: &str) -> Option<UserInfo> {
        self.users.read().get(user_id).cloned()
    }

    pub fn display_name(&self, user_id: &str) -> Option<String> {
        self.users
            .read()
            .get(user_id)
            .map(|u| u.display_name.clone())
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }

    pub fn clear(&self) {
        self.users.write().clear();
    }
}
