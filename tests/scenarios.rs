use chrono::{Duration, TimeZone, Utc};
use coachgate::{
    aggregate_self_repair_stats, build_delayed_verification_prompt, compute_ood_budget,
    evaluate_fast_lane, evaluate_retention_gate_from_rows, evaluate_self_repair_budget,
    select_delayed_verification_task_type, select_hybrid, should_trigger_immediate_self_repair,
    validate_delayed_verification, AttemptRow, Candidate, EngineConfig, FastLaneSignals,
    OodBudgetInput, OodSignal, RepairCycleRow, RetentionEvidenceRow, RetentionGateStatus,
    SelectionReason, SelfRepairHistory, TaskContext, IMMEDIATE_RETRY_MODE,
};

fn confident_signals() -> FastLaneSignals {
    FastLaneSignals {
        projection_confidence: 0.86,
        placement_confidence: 0.82,
        placement_uncertainty: 0.18,
        promotion_ready: false,
        stress_gate_required: false,
        target_stage_coverage: Some(0.74),
        cold_start_active: false,
        placement_fresh: false,
    }
}

#[test]
fn tie_goes_to_smaller_action_id() {
    let cfg = EngineConfig::default();
    let mut selector = cfg.selector.clone();
    selector.exploration_floor = 0.0;
    selector.temperature = 2.0;

    let d = select_hybrid(
        &[Candidate::new("B", 1.0, 1.0), Candidate::new("A", 1.0, 1.0)],
        &selector,
    )
    .unwrap();
    assert_eq!(d.chosen_action, "A");
}

#[test]
fn blocked_favourite_is_skipped_and_logged() {
    let d = select_hybrid(
        &[
            Candidate::new("speech_builder", 0.9, 1.8).blocked_by("verification_sla"),
            Candidate::new("qa_prompt", 0.8, 1.1),
            Candidate::new("target_vocab", 0.7, 0.9),
        ],
        &EngineConfig::default().selector,
    )
    .unwrap();

    assert_eq!(d.chosen_action, "qa_prompt");
    assert_eq!(d.candidate_action_set, vec!["qa_prompt", "target_vocab"]);
    assert_eq!(d.blocked_actions, vec!["speech_builder"]);
    let total: f64 = d.propensity_by_action.values().sum();
    assert!((total - 1.0).abs() < 1e-6);
    assert!(d
        .active_constraints
        .iter()
        .any(|c| c == "verification_sla"));
}

#[test]
fn everything_blocked_falls_back_deterministically() {
    let d = select_hybrid(
        &[
            Candidate::new("target_vocab", 0.7, 1.5).blocked_by("diagnostic_diversity_guard"),
            Candidate::new("qa_prompt", 1.1, 0.2).blocked_by("verification_sla"),
        ],
        &EngineConfig::default().selector,
    )
    .unwrap();
    assert!(d.fallback_applied);
    assert_eq!(d.chosen_action, "qa_prompt");
    assert_eq!(d.propensity, 1.0);
}

/// One learner's session, end to end: fast-lane check, OOD cadence, a failed task that
/// opens an immediate retry, the budget check, and the delayed verification that follows.
#[test]
fn learner_session_walkthrough() {
    let cfg = EngineConfig::default();
    let now = Utc.with_ymd_and_hms(2026, 2, 18, 10, 0, 0).unwrap();

    let fast_lane = evaluate_fast_lane(&confident_signals(), &cfg.fast_lane);
    assert!(fast_lane.eligible);

    let probes: Vec<OodSignal> = ["transfer_pass", "transfer_pass", "transfer_fail"]
        .iter()
        .enumerate()
        .map(|(i, v)| OodSignal::new(Some(*v), now - Duration::days(i as i64 + 1)))
        .collect();
    let budget = compute_ood_budget(
        &OodBudgetInput::new(16, SelectionReason::Weakness)
            .with_signals(probes)
            .with_fast_lane(fast_lane.clone()),
        &cfg.ood_budget,
    );
    assert!(budget.fast_lane_applied);
    assert_eq!(budget.interval, 8);
    assert!(budget.should_inject);

    // The task scored 55/100: an immediate retry is offered.
    assert!(should_trigger_immediate_self_repair("qa_prompt", None, Some(55.0)));

    let history = SelfRepairHistory {
        cycles: vec![RepairCycleRow {
            status: "completed".into(),
            source_task_type: Some("qa_prompt".into()),
            created_at: now - Duration::minutes(30),
        }],
        attempts: vec![
            AttemptRow {
                duration_sec: Some(600.0),
                self_repair_mode: None,
                created_at: now - Duration::minutes(40),
            },
            AttemptRow {
                duration_sec: Some(80.0),
                self_repair_mode: Some(IMMEDIATE_RETRY_MODE.into()),
                created_at: now - Duration::minutes(25),
            },
        ],
        now,
    };
    let stats = aggregate_self_repair_stats(&history, "qa_prompt", Some(70.0), &cfg.self_repair);
    let usage = evaluate_self_repair_budget(&stats, &cfg.self_repair);
    // (80 + 70) / (680 + 70) = 0.2
    assert_eq!(usage.projected_immediate_share, 0.2);
    assert!(!usage.exhausted);

    let verification_type = select_delayed_verification_task_type("qa_prompt");
    let prompt = build_delayed_verification_prompt(
        "Role-play asking a neighbour to water your plants.",
        verification_type,
    );
    let v = validate_delayed_verification(
        &TaskContext::new("qa_prompt", "Describe your daily routine."),
        &TaskContext::new(verification_type, prompt),
        &cfg.duplicate_validator,
    );
    assert!(v.valid, "{:?}", v.reasons);
}

#[test]
fn second_loop_on_same_skill_is_refused() {
    let usage = evaluate_self_repair_budget(
        &coachgate::SelfRepairStats {
            loops_used_for_skill_session: 2,
            session_total_duration_sec: 1200.0,
            immediate_duration_sec: 60.0,
            estimated_immediate_duration_sec: 60.0,
        },
        &EngineConfig::default().self_repair,
    );
    assert!(usage.exhausted);
    assert!(usage.reasons.contains(&"per_skill_loop_cap".to_string()));
}

#[test]
fn time_share_exactly_at_cap_is_allowed() {
    let cfg = EngineConfig::default().self_repair;
    let at_cap = evaluate_self_repair_budget(
        &coachgate::SelfRepairStats {
            loops_used_for_skill_session: 0,
            session_total_duration_sec: 300.0,
            immediate_duration_sec: 0.0,
            estimated_immediate_duration_sec: 100.0,
        },
        &cfg,
    );
    assert_eq!(at_cap.projected_immediate_share, 0.25);
    assert!(!at_cap.exhausted, "{:?}", at_cap.reasons);

    let over_cap = evaluate_self_repair_budget(
        &coachgate::SelfRepairStats {
            loops_used_for_skill_session: 0,
            session_total_duration_sec: 299.0,
            immediate_duration_sec: 0.0,
            estimated_immediate_duration_sec: 100.0,
        },
        &cfg,
    );
    assert!(over_cap.exhausted);
    assert_eq!(over_cap.reasons, vec!["session_time_share_cap"]);
}

#[test]
fn same_family_verification_is_a_duplicate() {
    let v = validate_delayed_verification(
        &TaskContext::new("qa_prompt", "Explain your daily routine."),
        &TaskContext::new("qa_prompt", "Talk about a trip you enjoyed."),
        &EngineConfig::default().duplicate_validator,
    );
    assert!(!v.valid);
    assert!(v.duplicate_task_family);
}

#[test]
fn promotion_window_disables_fast_lane() {
    let mut s = confident_signals();
    s.projection_confidence = 0.91;
    s.placement_confidence = 0.88;
    s.placement_uncertainty = 0.12;
    s.promotion_ready = true;
    let d = evaluate_fast_lane(&s, &EngineConfig::default().fast_lane);
    assert!(!d.eligible);
}

#[test]
fn retention_rate_exactly_at_threshold_passes() {
    let now = Utc.with_ymd_and_hms(2026, 2, 18, 0, 0, 0).unwrap();
    // Ten 7-day pairs, seven of which hold: 7 / 10 = 0.70.
    let rows: Vec<RetentionEvidenceRow> = (0..10)
        .flat_map(|i: i64| {
            let node = format!("node-{i}");
            let follow_up = if i < 7 { 0.8 } else { 0.4 };
            [(20, 0.9), (10, follow_up)].map(|(days_ago, score)| RetentionEvidenceRow {
                learner_id: "student-1".into(),
                node_id: node.clone(),
                created_at: now - Duration::days(days_ago),
                score,
            })
        })
        .collect();

    let m = coachgate::retention_pass_rate(&rows, 7, now);
    assert_eq!(m.sample_size, 10);
    assert_eq!(m.value, Some(0.7));

    let r = evaluate_retention_gate_from_rows(&rows, "B1", now, &EngineConfig::default().retention);
    assert_eq!(r.windows[0].status, RetentionGateStatus::Pass);
}

#[test]
fn retention_gate_needs_every_window() {
    let now = Utc.with_ymd_and_hms(2026, 2, 18, 0, 0, 0).unwrap();
    let row = |node: &str, days_ago: i64, score: f64| RetentionEvidenceRow {
        learner_id: "student-1".into(),
        node_id: node.into(),
        created_at: now - Duration::days(days_ago),
        score,
    };
    // Plenty of short-window evidence, nothing old enough for 30 or 90 days.
    let rows: Vec<RetentionEvidenceRow> = (0..4)
        .flat_map(|i| {
            let node = format!("node-{i}");
            vec![row(&node, 20 + i, 0.9), row(&node, 10 + i, 0.8)]
        })
        .collect();

    let cfg = EngineConfig::default().retention;
    let low = evaluate_retention_gate_from_rows(&rows, "A2", now, &cfg);
    assert!(!low.required && low.passed);

    let high = evaluate_retention_gate_from_rows(&rows, "B2", now, &cfg);
    assert!(high.required && !high.passed);
    assert_eq!(high.windows[0].status, RetentionGateStatus::Pass);
    assert_eq!(
        high.blocker_reasons,
        vec![
            "retention_30d_insufficient_sample",
            "retention_90d_insufficient_sample"
        ]
    );
}
