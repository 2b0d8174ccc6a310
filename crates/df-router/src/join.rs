//! Join/collect accumulation.
//!
//! Items whose next action is a JOIN are parked here under a [`JoinKey`]
//! until the group is released. A group releases as soon as it reaches
//! `max_num` members, or when its `max_age` runs out. The timeout is only
//! noticed by [`JoinAccumulator::expired`], which the periodic sweep calls;
//! at that point the group is released if it holds at least `min_num`
//! members and failed otherwise. A released or failed group is removed, so
//! each accumulation is settled exactly once.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use df_core::DeltaFileId;
use df_rules::JoinConfiguration;
use tracing::debug;

/// Group value used when the configured metadata key is missing.
pub const DEFAULT_JOIN_GROUP: &str = "DEFAULT";

/// Identifies one accumulation: the joining action plus the group value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JoinKey {
    pub flow: String,
    pub action: String,
    pub group: String,
}

impl std::fmt::Display for JoinKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}:{}", self.flow, self.action, self.group)
    }
}

/// One parked item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinMember {
    pub did: DeltaFileId,
    pub flow_id: u32,
    pub joined_at: DateTime<Utc>,
}

/// A member the router wants parked, with the settings of its group.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingJoin {
    pub key: JoinKey,
    pub config: JoinConfiguration,
    pub member: JoinMember,
}

/// A settled accumulation.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinRelease {
    /// Hand the members to the JOIN action.
    Ready { key: JoinKey, members: Vec<JoinMember> },
    /// Timed out below `min_num`.
    Failed {
        key: JoinKey,
        members: Vec<JoinMember>,
        min_num: usize,
    },
}

impl JoinRelease {
    pub fn key(&self) -> &JoinKey {
        match self {
            JoinRelease::Ready { key, .. } | JoinRelease::Failed { key, .. } => key,
        }
    }

    pub fn members(&self) -> &[JoinMember] {
        match self {
            JoinRelease::Ready { members, .. } | JoinRelease::Failed { members, .. } => members,
        }
    }
}

#[derive(Debug, Clone)]
struct JoinGroup {
    config: JoinConfiguration,
    first_joined: DateTime<Utc>,
    members: Vec<JoinMember>,
}

impl JoinGroup {
    fn deadline(&self) -> DateTime<Utc> {
        let max_age = chrono::Duration::seconds(i64::try_from(self.config.max_age_secs).unwrap_or(i64::MAX));
        self.first_joined
            .checked_add_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Open accumulations keyed by [`JoinKey`].
#[derive(Debug, Default)]
pub struct JoinAccumulator {
    groups: BTreeMap<JoinKey, JoinGroup>,
}

impl JoinAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `pending.member`. Returns the release when the group is full.
    ///
    /// The same item joining the same group twice is ignored.
    pub fn add(&mut self, pending: PendingJoin) -> Option<JoinRelease> {
        let PendingJoin {
            key,
            config,
            member,
        } = pending;
        let group = self.groups.entry(key.clone()).or_insert_with(|| JoinGroup {
            config,
            first_joined: member.joined_at,
            members: Vec::new(),
        });
        if group
            .members
            .iter()
            .any(|m| m.did == member.did && m.flow_id == member.flow_id)
        {
            return None;
        }
        group.members.push(member);
        debug!(key = %key, members = group.members.len(), "Item joined");

        let full = group
            .config
            .max_num
            .is_some_and(|max| group.members.len() >= max as usize);
        if !full {
            return None;
        }
        self.groups
            .remove(&key)
            .map(|group| JoinRelease::Ready {
                key,
                members: group.members,
            })
    }

    /// Settle every group whose `max_age` has run out by `now`.
    pub fn expired(&mut self, now: DateTime<Utc>) -> Vec<JoinRelease> {
        let due: Vec<JoinKey> = self
            .groups
            .iter()
            .filter(|(_, group)| group.deadline() <= now)
            .map(|(key, _)| key.clone())
            .collect();

        due.into_iter()
            .filter_map(|key| {
                let group = self.groups.remove(&key)?;
                let min_num = group.config.min_members();
                Some(if group.members.len() >= min_num {
                    JoinRelease::Ready {
                        key,
                        members: group.members,
                    }
                } else {
                    JoinRelease::Failed {
                        key,
                        members: group.members,
                        min_num,
                    }
                })
            })
            .collect()
    }

    /// Number of open groups.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Members parked in the group `key`, if it is open.
    pub fn members(&self, key: &JoinKey) -> Option<&[JoinMember]> {
        self.groups.get(key).map(|g| g.members.as_slice())
    }
}
