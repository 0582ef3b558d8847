//! 防循环守卫
//!
//! 「新信息」以观察摘要（observation_digest）衡量：某次尝试得到了此前从未出现过的摘要，
//! 即视为上下文中出现了新信息，同一 fingerprint 的连续计数归零。

use std::collections::HashSet;

use crate::core::{Attempt, Fingerprint};

/// 自上次出现新信息以来，`fingerprint` 被尝试的次数
pub fn stale_repeats(attempts: &[Attempt], fingerprint: &Fingerprint) -> usize {
    let mut seen: HashSet<&str> = HashSet::new();
    let mut streak = 0;
    for attempt in attempts {
        let novel = attempt
            .observation_digest
            .as_deref()
            .map(|d| seen.insert(d))
            .unwrap_or(false);
        if novel {
            streak = 0;
        }
        if &attempt.fingerprint == fingerprint {
            streak += 1;
        }
    }
    streak
}

/// 再次提出 `fingerprint` 是否会触发重复动作上限：无新信息的尝试次数已经超过 `threshold`
pub fn trips(attempts: &[Attempt], fingerprint: &Fingerprint, threshold: usize) -> bool {
    stale_repeats(attempts, fingerprint) > threshold
}
