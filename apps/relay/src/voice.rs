//! Voice participant registry, scoped per channel. Voice state is decoupled
//! from socket lifetime: a dropped socket keeps its participant entry so a
//! quick reconnect resumes with mute/deafen intact, and the idle reaper
//! bounds memory when the client never comes back.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use lantern_proto::{ParticipantState, RoomId, UserId};

#[derive(Debug, Clone)]
struct VoiceEntry {
    state: ParticipantState,
    last_activity: DateTime<Utc>,
}

#[derive(Default)]
pub struct VoiceParticipantRegistry {
    channels: DashMap<RoomId, DashMap<UserId, VoiceEntry>>,
}

impl VoiceParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join_voice(
        &self,
        user_id: &str,
        channel_id: &str,
        meeting_id: &str,
        muted: bool,
        deafened: bool,
        bot: bool,
    ) -> ParticipantState {
        let now = Utc::now();
        let state = ParticipantState {
            user_id: user_id.to_string(),
            channel_id: channel_id.to_string(),
            meeting_id: meeting_id.to_string(),
            is_muted: muted,
            is_deafened: deafened,
            joined_at: now,
            is_bot: bot,
        };
        self.channels
            .entry(channel_id.to_string())
            .or_default()
            .insert(
                user_id.to_string(),
                VoiceEntry {
                    state: state.clone(),
                    last_activity: now,
                },
            );
        state
    }

    pub fn leave_voice(&self, channel_id: &str, user_id: &str) -> bool {
        let Some(channel) = self.channels.get(channel_id) else {
            return false;
        };
        let removed = channel.remove(user_id).is_some();
        let empty = channel.is_empty();
        drop(channel);
        if empty {
            self.channels.remove_if(channel_id, |_, c| c.is_empty());
        }
        removed
    }

    pub fn roster(&self, channel_id: &str) -> Vec<ParticipantState> {
        self.channels
            .get(channel_id)
            .map(|channel| channel.iter().map(|e| e.state.clone()).collect())
            .unwrap_or_default()
    }

    pub fn set_muted(
        &self,
        channel_id: &str,
        user_id: &str,
        muted: bool,
    ) -> Option<ParticipantState> {
        self.update(channel_id, user_id, |state| state.is_muted = muted)
    }

    pub fn set_deafened(
        &self,
        channel_id: &str,
        user_id: &str,
        deafened: bool,
    ) -> Option<ParticipantState> {
        self.update(channel_id, user_id, |state| state.is_deafened = deafened)
    }

    fn update(
        &self,
        channel_id: &str,
        user_id: &str,
        apply: impl FnOnce(&mut ParticipantState),
    ) -> Option<ParticipantState> {
        let channel = self.channels.get(channel_id)?;
        let mut entry = channel.get_mut(user_id)?;
        apply(&mut entry.state);
        entry.last_activity = Utc::now();
        Some(entry.state.clone())
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Remove entries idle longer than `max_idle` as of `now`; returns what
    /// was removed so callers can announce the departures. `now` is a
    /// parameter so tests control the clock.
    pub fn reap_idle(&self, max_idle: Duration, now: DateTime<Utc>) -> Vec<(RoomId, UserId)> {
        let mut reaped = Vec::new();
        for channel in self.channels.iter() {
            let channel_id = channel.key().clone();
            let idle: Vec<UserId> = channel
                .iter()
                .filter(|e| now - e.last_activity > max_idle)
                .map(|e| e.key().clone())
                .collect();
            for user_id in idle {
                channel.remove(&user_id);
                reaped.push((channel_id.clone(), user_id));
            }
        }
        self.channels.retain(|_, channel| !channel.is_empty());
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_mutate_and_roster() {
        let registry = VoiceParticipantRegistry::new();
        registry.join_voice("user-a", "chan-1", "meet-1", false, false, false);
        registry.join_voice("user-b", "chan-1", "meet-1", true, false, false);

        let state = registry.set_deafened("chan-1", "user-a", true).unwrap();
        assert!(state.is_deafened);

        let roster = registry.roster("chan-1");
        assert_eq!(roster.len(), 2);
        assert!(registry.leave_voice("chan-1", "user-a"));
        assert!(!registry.leave_voice("chan-1", "user-a"));
        assert_eq!(registry.roster("chan-1").len(), 1);
    }

    #[test]
    fn same_user_has_independent_state_per_channel() {
        let registry = VoiceParticipantRegistry::new();
        registry.join_voice("user-a", "chan-1", "meet-1", false, false, false);
        registry.join_voice("user-a", "chan-2", "meet-2", false, false, false);

        registry.set_muted("chan-1", "user-a", true);

        assert!(registry.roster("chan-1")[0].is_muted);
        assert!(!registry.roster("chan-2")[0].is_muted);
    }

    // A participant mutes, then their process crashes without leave-voice.
    // The reaper clears the entry once it has been idle past the threshold.
    #[test]
    fn reaper_removes_idle_state_left_by_a_crash() {
        let registry = VoiceParticipantRegistry::new();
        registry.join_voice("user-a", "chan-1", "meet-1", false, false, false);
        registry.set_muted("chan-1", "user-a", true);

        let max_idle = Duration::minutes(30);

        // Not yet idle long enough.
        let reaped = registry.reap_idle(max_idle, Utc::now() + Duration::minutes(29));
        assert!(reaped.is_empty());
        assert_eq!(registry.roster("chan-1").len(), 1);

        let reaped = registry.reap_idle(max_idle, Utc::now() + Duration::minutes(31));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0], ("chan-1".to_string(), "user-a".to_string()));
        assert!(registry.roster("chan-1").is_empty());
        assert_eq!(registry.channel_count(), 0);
    }
}
