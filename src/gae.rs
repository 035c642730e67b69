//! Advantage and return estimation over one agent's rollout.
//!
//! Both estimators take per-environment columns of length T and hand back
//! advantage/return columns of the same length.

/// Generalized advantage estimation.
///
/// The backward recursion runs t = T-2 ..= 0. Index T-1 never receives a
/// backward-computed value and keeps the zero it was allocated with: there is
/// no stored value estimate beyond the horizon, so the final step bootstraps
/// against zero. Callers size every derived buffer to T and rely on that
/// boundary slot.
pub fn gae_advantages(
    rewards: &[f32],
    values: &[f32],
    dones: &[f32],
    gamma: f32,
    lambda: f32,
) -> (Vec<f32>, Vec<f32>) {
    let t_max = rewards.len();
    debug_assert_eq!(values.len(), t_max);
    debug_assert_eq!(dones.len(), t_max);

    let mut advantages = vec![0.0f32; t_max];
    let mut lastgaelam = 0.0f32;
    for t in (0..t_max.saturating_sub(1)).rev() {
        let nextnonterminal = 1.0 - dones[t + 1];
        let delta = rewards[t] + gamma * values[t + 1] * nextnonterminal - values[t];
        lastgaelam = delta + gamma * lambda * nextnonterminal * lastgaelam;
        advantages[t] = lastgaelam;
    }

    let returns = advantages
        .iter()
        .zip(values)
        .map(|(a, v)| a + v)
        .collect();
    (advantages, returns)
}

/// Plain discounted-return fallback: advantage = return - value.
///
/// The recurrence reads `dones[t + 1]` and `returns[t + 1]`, so it runs over
/// the same t = T-2 ..= 0 range as [`gae_advantages`] and leaves the final
/// return at its zero boundary.
pub fn discounted_returns(
    rewards: &[f32],
    values: &[f32],
    dones: &[f32],
    gamma: f32,
) -> (Vec<f32>, Vec<f32>) {
    let t_max = rewards.len();
    debug_assert_eq!(values.len(), t_max);
    debug_assert_eq!(dones.len(), t_max);

    let mut returns = vec![0.0f32; t_max];
    for t in (0..t_max.saturating_sub(1)).rev() {
        let nextnonterminal = 1.0 - dones[t + 1];
        returns[t] = rewards[t] + gamma * nextnonterminal * returns[t + 1];
    }

    let advantages = returns
        .iter()
        .zip(values)
        .map(|(r, v)| r - v)
        .collect();
    (advantages, returns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lambda_one_is_the_multi_step_return_minus_baseline() {
        // With no terminals and lambda = 1, the GAE recursion telescopes
        // into a plain sum of discounted TD residuals.
        let rewards = vec![1.0, 0.5, -0.25, 2.0, 0.0, 1.5];
        let values = vec![0.3, -0.1, 0.7, 0.2, 0.9, -0.4];
        let dones = vec![0.0; 6];
        let gamma = 0.99f32;

        let (gae_adv, gae_ret) = gae_advantages(&rewards, &values, &dones, gamma, 1.0);

        let t_max = rewards.len();
        for t in 0..t_max - 1 {
            let mut expected = 0.0f32;
            let mut discount = 1.0f32;
            for k in t..t_max - 1 {
                expected += discount * (rewards[k] + gamma * values[k + 1] - values[k]);
                discount *= gamma;
            }
            assert!(
                (gae_adv[t] - expected).abs() < 1e-4,
                "t={t}: {} vs {}",
                gae_adv[t],
                expected
            );
            assert!((gae_ret[t] - (expected + values[t])).abs() < 1e-4);
        }
    }

    #[test]
    fn terminal_cuts_the_bootstrap() {
        let rewards = vec![1.0, 1.0, 1.0, 1.0];
        let values = vec![5.0, 5.0, 5.0, 5.0];
        // done flag at t = 2 masks everything after it out of step 1's view
        let dones = vec![0.0, 0.0, 1.0, 0.0];

        let (adv, _) = gae_advantages(&rewards, &values, &dones, 0.99, 0.95);
        // delta[1] = r[1] + gamma * v[2] * 0 - v[1], and no tail carries over
        assert!((adv[1] - (1.0 - 5.0)).abs() < 1e-6);
    }

    #[test]
    fn final_index_keeps_its_zero_boundary() {
        let rewards = vec![1.0, 2.0, 3.0];
        let values = vec![0.5, 0.5, 0.5];
        let dones = vec![0.0; 3];

        let (adv, ret) = gae_advantages(&rewards, &values, &dones, 0.99, 0.95);
        assert_eq!(adv[2], 0.0);
        assert_eq!(ret[2], values[2]);

        let (fadv, fret) = discounted_returns(&rewards, &values, &dones, 0.99);
        assert_eq!(fret[2], 0.0);
        assert_eq!(fadv[2], -values[2]);
    }
}
