//! Integration tests for the head-adaptive allocators.

use ndarray::{s, Array3};

use kv_press::attention::layer::AttentionImplementation;
use kv_press::press::select::{global_bottom_k, top_k};
use kv_press::press::{
    AdaKvPress, Budget, CriticalAdaKvPress, CriticalKvScorer, KnormScorer, Press, Scorer,
};
use kv_press::synthetic::{generate, SyntheticConfig};
use kv_press::PressError;

fn model() -> SyntheticConfig {
    SyntheticConfig {
        batch_size: 2,
        num_key_value_heads: 4,
        q_len: 48,
        ..Default::default()
    }
}

fn knorm(budget: Budget) -> KnormScorer {
    KnormScorer::new(budget)
}

#[test]
fn test_discard_count_under_ratio() {
    let data = generate(&model(), 0, false).unwrap();
    let layer = data.inputs().unwrap();

    for ratio in [0.1, 0.25, 0.5, 0.7, 0.9] {
        let budget = Budget::from_ratio(ratio).unwrap();
        let n_kept = budget.n_kept(48);
        assert_eq!(n_kept, (48.0 * (1.0 - ratio)).round() as usize);

        let press = AdaKvPress::new(knorm(budget), 0.2).unwrap();
        let discard = press.compress(&layer).unwrap().discard_set().unwrap().clone();
        assert_eq!(discard.len(), 2 * 4 * (48 - n_kept), "ratio {ratio}");
        for b in 0..2 {
            assert_eq!(discard.retained_per_head().row(b).sum(), 4 * n_kept);
        }
    }
}

#[test]
fn test_discard_count_under_capacity() {
    let data = generate(&model(), 1, false).unwrap();
    let layer = data.inputs().unwrap();

    let press = AdaKvPress::new(knorm(Budget::with_capacity(10).unwrap()), 0.2).unwrap();
    let out = press.compress(&layer).unwrap();
    assert_eq!(out.discard_set().unwrap().len(), 2 * 4 * (48 - 10));

    // the cap wins over the ratio
    let budget = Budget::new(0.9, Some(30)).unwrap();
    let press = AdaKvPress::new(knorm(budget), 0.2).unwrap();
    let out = press.compress(&layer).unwrap();
    assert_eq!(out.discard_set().unwrap().len(), 2 * 4 * (48 - 30));

    // a cap beyond q_len keeps everything but still takes the masking path
    let press = AdaKvPress::new(knorm(Budget::with_capacity(100).unwrap()), 0.2).unwrap();
    let out = press.compress(&layer).unwrap();
    assert_eq!(out.kind(), "masked");
    assert!(out.discard_set().unwrap().is_empty());
}

#[test]
fn test_safeguard_floor_holds() {
    let data = generate(&model(), 2, false).unwrap();
    let layer = data.inputs().unwrap();
    let budget = Budget::from_ratio(0.75).unwrap();
    let n_kept = budget.n_kept(48);

    for alpha in [0.1, 0.25, 0.5, 0.9] {
        let n_safe = (n_kept as f64 * alpha).floor() as usize;

        let ada = AdaKvPress::new(knorm(budget), alpha).unwrap();
        let retained = ada.compress(&layer).unwrap().discard_set().unwrap().retained_per_head();
        assert!(retained.iter().all(|&n| n >= n_safe), "AdaKV alpha {alpha}");

        let critical = CriticalAdaKvPress::new(knorm(budget), alpha, 1e-4, 0.5).unwrap();
        let allocation = critical.allocate(&layer).unwrap();
        assert!(
            allocation.head_budgets.iter().all(|&n| n >= n_safe),
            "CriticalAdaKV alpha {alpha}"
        );
    }
}

#[test]
fn test_alpha_zero_is_global_top_k() {
    let data = generate(&model(), 3, false).unwrap();
    let layer = data.inputs().unwrap();
    let budget = Budget::from_ratio(0.5).unwrap();

    let scores = knorm(budget).score(&layer).unwrap();
    let expected = global_bottom_k(&scores, 4 * 24);

    let press = AdaKvPress::new(knorm(budget), 0.0).unwrap();
    let out = press.compress(&layer).unwrap();
    assert_eq!(out.discard_set().unwrap(), &expected);
}

#[test]
fn test_alpha_one_is_uniform_per_head() {
    let data = generate(&model(), 4, false).unwrap();
    let layer = data.inputs().unwrap();
    let budget = Budget::from_ratio(0.5).unwrap();
    let scores = knorm(budget).score(&layer).unwrap();

    let press = AdaKvPress::new(knorm(budget), 1.0).unwrap();
    let keep = press.compress(&layer).unwrap().discard_set().unwrap().keep_mask();

    let mut expected = Array3::from_elem((2, 4, 48), false);
    for b in 0..2 {
        for h in 0..4 {
            for pos in top_k(scores.slice(s![b, h, ..]), 24) {
                expected[[b, h, pos]] = true;
            }
        }
    }
    assert_eq!(keep, expected);
}

#[test]
fn test_critical_stage_one_survives_allocation() {
    let data = generate(&model(), 5, false).unwrap();
    let layer = data.inputs().unwrap();
    let budget = Budget::from_ratio(0.8).unwrap();

    let base_scores = knorm(budget).score(&layer).unwrap();
    let scorer = CriticalKvScorer::new(knorm(budget), 1e-4, 0.5).unwrap();
    let budget1 = scorer.first_stage_budget(48);
    assert!(budget1 > 0);

    let press = AdaKvPress::new(scorer, 0.2).unwrap();
    let discard = press.compress(&layer).unwrap().discard_set().unwrap().clone();

    for b in 0..2 {
        for h in 0..4 {
            for pos in top_k(base_scores.slice(s![b, h, ..]), budget1) {
                assert!(!discard.contains(b, h, pos), "batch {b} head {h} pos {pos}");
            }
        }
    }
}

#[test]
fn test_critical_adakv_budgets_are_consistent() {
    let data = generate(&model(), 6, false).unwrap();
    let layer = data.inputs().unwrap();
    let budget = Budget::from_ratio(0.6).unwrap();
    let n_kept = budget.n_kept(48);

    let press = CriticalAdaKvPress::new(knorm(budget), 0.2, 1e-4, 0.5).unwrap();
    let allocation = press.allocate(&layer).unwrap();

    for b in 0..2 {
        assert_eq!(allocation.head_budgets.row(b).sum(), n_kept * 4);
    }
    let retained = allocation.discard.retained_per_head();
    for ((b, h), &n) in retained.indexed_iter() {
        assert!(n <= allocation.head_budgets[[b, h]]);
    }
    assert_eq!(allocation.discard.len(), 2 * 4 * (48 - n_kept));

    let out = press.compress(&layer).unwrap();
    assert_eq!(out.discard_set().unwrap(), &allocation.discard);
}

#[test]
fn test_allocators_reject_eager_attention() {
    let cfg = SyntheticConfig {
        attn_implementation: AttentionImplementation::Eager,
        ..model()
    };
    let data = generate(&cfg, 0, false).unwrap();
    let layer = data.inputs().unwrap();
    let budget = Budget::from_ratio(0.5).unwrap();

    let ada = AdaKvPress::new(knorm(budget), 0.2).unwrap();
    assert_eq!(
        ada.compress(&layer).unwrap_err(),
        PressError::UnsupportedAttention(AttentionImplementation::Eager)
    );

    let critical = CriticalAdaKvPress::new(knorm(budget), 0.2, 1e-4, 0.5).unwrap();
    assert_eq!(
        critical.compress(&layer).unwrap_err(),
        PressError::UnsupportedAttention(AttentionImplementation::Eager)
    );
}

#[test]
fn test_flash_attention_is_maskable() {
    let cfg = SyntheticConfig {
        attn_implementation: AttentionImplementation::FlashAttention2,
        ..model()
    };
    let data = generate(&cfg, 0, false).unwrap();
    let press = AdaKvPress::new(knorm(Budget::from_ratio(0.5).unwrap()), 0.2).unwrap();
    assert_eq!(press.compress(&data.inputs().unwrap()).unwrap().kind(), "masked");
}

#[test]
fn test_critical_adakv_zero_budget_prunes_whole_head() {
    let cfg = SyntheticConfig {
        q_len: 16,
        ..Default::default()
    };
    let mut data = generate(&cfg, 0, false).unwrap();
    // Huge keys on head 1 push every one of its positions below head 0.
    data.keys.slice_mut(s![.., 1, .., ..]).mapv_inplace(|k| k * 1000.0);
    let layer = data.inputs().unwrap();

    let budget = Budget::from_ratio(0.5).unwrap();
    let n_kept = budget.n_kept(16);
    assert_eq!(n_kept, 8);

    let press = CriticalAdaKvPress::new(knorm(budget), 0.0, 1e-4, 0.5).unwrap();
    let allocation = press.allocate(&layer).unwrap();

    assert_eq!(allocation.head_budgets.row(0).to_vec(), vec![16, 0]);
    assert_eq!(allocation.discard.retained_per_head().row(0).to_vec(), vec![16, 0]);
    assert_eq!(allocation.discard.len(), 2 * (16 - n_kept));
    assert!((0..16).all(|pos| allocation.discard.contains(0, 1, pos)));
}
