//! Two-phase CA rollover timing.
//!
//! Successors are published `publish_lead` before the newest CA expires and
//! only take over signing once the current signer has less than
//! `activate_lead` left, so every certificate issued under the old CA still
//! verifies for its whole lifetime.

use caucase_storage::CaKeyPair;

/// CA generations trusted at `now`, oldest first.
pub fn trusted(pairs: &[CaKeyPair], now: u64) -> Vec<&CaKeyPair> {
    pairs.iter().filter(|pair| pair.is_valid_at(now)).collect()
}

/// The pair that signs at `now`.
///
/// The oldest valid pair with at least `activate_lead` seconds left wins; if
/// none has that much left, the newest valid pair signs.
pub fn active_signer(pairs: &[CaKeyPair], now: u64, activate_lead: u64) -> Option<&CaKeyPair> {
    let valid = trusted(pairs, now);
    valid
        .iter()
        .find(|pair| pair.remaining(now) >= activate_lead)
        .or(valid.last())
        .copied()
}

/// Whether a new generation has to be created at `now`.
///
/// Due once the newest generation has `publish_lead` seconds or less left.
pub fn needs_new_pair(pairs: &[CaKeyPair], now: u64, publish_lead: u64) -> bool {
    match trusted(pairs, now).last() {
        Some(newest) => newest.remaining(now) <= publish_lead,
        None => true,
    }
}

/// Earliest moment the publish or promotion step is due.
///
/// Returns `now` when a step is already overdue.
pub fn next_deadline(pairs: &[CaKeyPair], now: u64, publish_lead: u64, activate_lead: u64) -> u64 {
    let valid = trusted(pairs, now);
    let Some(newest) = valid.last() else {
        return now;
    };

    let mut deadline = newest.not_after.saturating_sub(publish_lead);
    if let Some(active) = active_signer(pairs, now, activate_lead) {
        if active.serial != newest.serial {
            // First second at which the active pair no longer qualifies.
            deadline = deadline.min(active.not_after.saturating_sub(activate_lead) + 1);
        }
    }
    // An expiring generation drops out of the trusted set.
    if let Some(oldest) = valid.first() {
        deadline = deadline.min(oldest.not_after);
    }
    deadline.max(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use caucase_storage::Hierarchy;

    fn pair(serial: &str, not_before: u64, not_after: u64) -> CaKeyPair {
        CaKeyPair {
            hierarchy: Hierarchy::Service,
            serial: serial.to_string(),
            key_pem: String::new(),
            certificate_pem: String::new(),
            not_before,
            not_after,
            created_at: not_before,
        }
    }

    // crt life 100, ca life 400, publish lead 200, activate lead 100
    const PUBLISH: u64 = 200;
    const ACTIVATE: u64 = 100;

    #[test]
    fn test_genesis_needed_when_empty_or_expired() {
        assert!(needs_new_pair(&[], 0, PUBLISH));
        assert!(needs_new_pair(&[pair("a", 0, 400)], 400, PUBLISH));
        assert_eq!(next_deadline(&[], 50, PUBLISH, ACTIVATE), 50);
    }

    #[test]
    fn test_publish_timing() {
        let pairs = [pair("a", 0, 400)];
        assert!(!needs_new_pair(&pairs, 199, PUBLISH));
        assert!(needs_new_pair(&pairs, 200, PUBLISH));
        assert_eq!(next_deadline(&pairs, 10, PUBLISH, ACTIVATE), 200);
    }

    #[test]
    fn test_successor_waits_before_signing() {
        let pairs = [pair("a", 0, 400), pair("b", 200, 600)];

        // Published but not yet active.
        assert_eq!(active_signer(&pairs, 250, ACTIVATE).unwrap().serial, "a");
        assert_eq!(active_signer(&pairs, 300, ACTIVATE).unwrap().serial, "a");
        // Promoted once "a" has less than one certificate lifetime left.
        assert_eq!(active_signer(&pairs, 301, ACTIVATE).unwrap().serial, "b");
        // Both still trusted.
        assert_eq!(trusted(&pairs, 301).len(), 2);
        assert_eq!(trusted(&pairs, 400).len(), 1);

        assert_eq!(next_deadline(&pairs, 250, PUBLISH, ACTIVATE), 301);
        assert_eq!(next_deadline(&pairs, 350, PUBLISH, ACTIVATE), 400);
        assert_eq!(next_deadline(&pairs, 450, PUBLISH, ACTIVATE), 450);
    }

    #[test]
    fn test_newest_signs_when_nothing_qualifies() {
        let pairs = [pair("a", 0, 400)];
        assert_eq!(active_signer(&pairs, 350, ACTIVATE).unwrap().serial, "a");
        assert!(active_signer(&pairs, 400, ACTIVATE).is_none());
    }
}
