//! Identity/profile lookup boundary.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::VisitorProfile;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("profile not found: {0}")]
    NotFound(String),

    #[error("profile service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<VisitorProfile, ProfileError>;
}

/// Profiles held in memory; anything unknown is `NotFound`, which callers
/// turn into a guest name.
#[derive(Default)]
pub struct StaticProfiles {
    profiles: RwLock<HashMap<String, VisitorProfile>>,
}

impl StaticProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user_id: &str, profile: VisitorProfile) {
        self.profiles
            .write()
            .await
            .insert(user_id.to_string(), profile);
    }
}

#[async_trait]
impl ProfileLookup for StaticProfiles {
    async fn get_profile(&self, user_id: &str) -> Result<VisitorProfile, ProfileError> {
        self.profiles
            .read()
            .await
            .get(user_id)
            .cloned()
            .ok_or_else(|| ProfileError::NotFound(user_id.to_string()))
    }
}
