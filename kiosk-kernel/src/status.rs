/**
 * STATUT EFFECTIF - Réconciliation heartbeat / statut stocké
 *
 * RÔLE : Fonction pure, seule source de vérité pour "ce kiosque est-il joignable".
 * Utilisée par les vues liste/détail de l'API admin. L'éligibilité d'une migration
 * n'en dépend pas : un kiosque hors ligne reçoit son token swap au prochain poll.
 *
 * RÈGLES (dans l'ordre) :
 * 1. unconfigured stocké → unconfigured
 * 2. dernier contact plus vieux que le seuil → offline
 * 3. upgrade démarré depuis moins que la période de grâce → upgrading
 * 4. sinon statut stocké tel quel
 */

use crate::models::{Device, DeviceStatus};
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone, Copy)]
pub struct StatusPolicy {
    pub offline_threshold: Duration,
    pub upgrade_grace: Duration,
}

impl Default for StatusPolicy {
    fn default() -> Self {
        Self {
            offline_threshold: Duration::minutes(10),
            upgrade_grace: Duration::minutes(30),
        }
    }
}

pub fn effective_status(device: &Device, now: OffsetDateTime, policy: &StatusPolicy) -> DeviceStatus {
    if device.status == DeviceStatus::Unconfigured {
        return DeviceStatus::Unconfigured;
    }

    // Sans aucun contact connu, le kiosque n'est pas considéré comme expiré
    if let Some(contact) = device.last_heartbeat.or(device.last_seen) {
        if now - contact > policy.offline_threshold {
            return DeviceStatus::Offline;
        }
    }

    if let Some(started) = device.upgrade_started_at {
        if now - started < policy.upgrade_grace {
            return DeviceStatus::Upgrading;
        }
    }

    device.status
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2025-03-01 12:00 UTC);

    fn device(status: DeviceStatus, heartbeat_age: Option<Duration>) -> Device {
        Device {
            id: 1,
            name: "lobby".into(),
            tenant_id: Some(1),
            status,
            last_heartbeat: heartbeat_age.map(|age| NOW - age),
            last_seen: None,
            upgrade_started_at: None,
            debug_mode: false,
            fast_loop_enabled: false,
            poll_interval_secs: 300,
            license_active: true,
        }
    }

    #[test]
    fn test_stale_heartbeat_overrides_online() {
        let d = device(DeviceStatus::Online, Some(Duration::minutes(20)));
        assert_eq!(effective_status(&d, NOW, &StatusPolicy::default()), DeviceStatus::Offline);
    }

    #[test]
    fn test_unconfigured_wins_over_fresh_heartbeat() {
        let d = device(DeviceStatus::Unconfigured, Some(Duration::seconds(5)));
        assert_eq!(effective_status(&d, NOW, &StatusPolicy::default()), DeviceStatus::Unconfigured);
        let stale = device(DeviceStatus::Unconfigured, Some(Duration::hours(3)));
        assert_eq!(effective_status(&stale, NOW, &StatusPolicy::default()), DeviceStatus::Unconfigured);
    }

    #[test]
    fn test_upgrade_grace_window() {
        let policy = StatusPolicy::default();
        let mut d = device(DeviceStatus::Online, Some(Duration::minutes(1)));
        d.upgrade_started_at = Some(NOW - Duration::minutes(5));
        assert_eq!(effective_status(&d, NOW, &policy), DeviceStatus::Upgrading);

        d.upgrade_started_at = Some(NOW - Duration::minutes(45));
        assert_eq!(effective_status(&d, NOW, &policy), DeviceStatus::Online);
    }

    #[test]
    fn test_last_seen_fallback_and_no_contact() {
        let policy = StatusPolicy::default();
        let mut d = device(DeviceStatus::Online, None);
        assert_eq!(effective_status(&d, NOW, &policy), DeviceStatus::Online);

        d.last_seen = Some(NOW - Duration::hours(1));
        assert_eq!(effective_status(&d, NOW, &policy), DeviceStatus::Offline);
    }

    #[test]
    fn test_fresh_device_keeps_raw_status() {
        let d = device(DeviceStatus::Error, Some(Duration::minutes(2)));
        assert_eq!(effective_status(&d, NOW, &StatusPolicy::default()), DeviceStatus::Error);
    }
}
