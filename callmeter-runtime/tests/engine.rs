//! End-to-end behavior of a profiling session driven through the public API.

use callmeter_runtime::{
    Algorithm, Config, Error, FunctionKey, FunctionRef, FunctionSelector, ProfileReport, ProfilerController,
    SessionState, UNTRACKED,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("callmeter_runtime=debug")
        .with_test_writer()
        .try_init();
}

fn f(name: &str) -> FunctionRef<'_> {
    FunctionRef::function(name)
}

fn enabled(functions: &[&str], algorithm: Algorithm) -> ProfilerController {
    init_logging();
    let mut p = ProfilerController::new();
    let cfg = Config {
        algorithm,
        ..Config::tracking(functions).unwrap()
    };
    p.enable(&cfg).unwrap();
    p
}

#[test]
fn foo_bar_baz() {
    for algorithm in [Algorithm::Hash, Algorithm::Trie] {
        let mut p = enabled(&["foo", "bar"], algorithm);
        assert!(p.on_call_enter(f("foo")));
        assert!(p.on_call_enter(f("bar")));
        p.on_call_exit().unwrap();
        p.on_call_exit().unwrap();
        assert!(!p.on_call_enter(f("baz")));

        let report = p.disable().unwrap();
        assert_eq!(report.algorithm, algorithm);
        let names: Vec<String> = report.functions.iter().map(|s| s.key.to_string()).collect();
        assert_eq!(names, ["foo", "bar"]);
        for stats in &report.functions {
            assert_eq!(stats.call_count, 1);
            assert!(stats.wall_time_us > 0.0, "{} has no wall time", stats.key);
        }
    }
}

#[test]
fn widget_render_matches_only_the_exact_method() {
    let mut p = enabled(&["Widget:render"], Algorithm::Trie);
    assert!(!p.on_call_enter(FunctionRef::method("Widget", "renderAll")));
    assert!(!p.on_call_enter(f("render")));
    assert!(!p.on_call_enter(FunctionRef::method("Gadget", "render")));
    assert!(p.on_call_enter(FunctionRef::method("Widget", "render")));
    p.on_call_exit().unwrap();

    let report = p.disable().unwrap();
    let render = report.get("Widget:render").unwrap();
    assert_eq!(render.key.owner(), Some("Widget"));
    assert_eq!(render.key.name(), "render");
    assert_eq!(render.call_count, 1);
}

/// Random well-nested traffic over a mix of tracked and untracked names.
fn random_session(p: &mut ProfilerController, rng: &mut StdRng, names: &[&str], steps: usize) -> u64 {
    let mut open: Vec<bool> = Vec::new();
    let mut tracked = 0;
    for _ in 0..steps {
        if open.is_empty() || rng.gen_bool(0.55) {
            let name = names[rng.gen_range(0..names.len())];
            let is_tracked = p.on_call_enter(f(name));
            tracked += u64::from(is_tracked);
            open.push(is_tracked);
        } else if open.pop() == Some(true) {
            p.on_call_exit().unwrap();
        }
    }
    while let Some(is_tracked) = open.pop() {
        if is_tracked {
            p.on_call_exit().unwrap();
        }
    }
    tracked
}

#[test]
fn call_counts_sum_to_tracked_enters() {
    let names = ["a", "b", "c", "d", "untracked", "other"];
    for seed in 0..8 {
        let mut rng = StdRng::seed_from_u64(seed);
        let algorithm = if seed % 2 == 0 { Algorithm::Hash } else { Algorithm::Trie };
        let mut p = enabled(&["a", "b", "c", "d"], algorithm);
        let tracked = random_session(&mut p, &mut rng, &names, 2_000);
        let report = p.disable().unwrap();
        assert_eq!(report.total_calls(), tracked, "seed {seed}");
        assert_eq!(report.unwound_frames, 0);
    }
}

#[test]
fn wall_time_never_decreases() {
    let mut p = enabled(&["tick"], Algorithm::Trie);
    let tick = |report: ProfileReport| {
        let stats = report.get("tick").unwrap();
        (stats.call_count, stats.wall_time_us)
    };
    let mut last = 0.0;
    for round in 1..=50u64 {
        assert!(p.on_call_enter(f("tick")));
        // Open frames do not count yet.
        assert_eq!(tick(p.snapshot().unwrap()).0, round - 1);
        p.on_call_exit().unwrap();
        let (calls, wall) = tick(p.snapshot().unwrap());
        assert_eq!(calls, round);
        assert!(wall >= last, "round {round}: {wall} < {last}");
        last = wall;
    }
    assert_eq!(tick(p.disable().unwrap()), (50, last));
    assert!(p.snapshot().is_none());
}

#[test]
fn unwinding_k_open_frames_adds_k_calls() {
    for k in [0usize, 1, 5, 64] {
        let mut p = enabled(&["outer", "inner"], Algorithm::Hash);
        assert!(p.on_call_enter(f("outer")));
        p.on_call_exit().unwrap();
        for i in 0..k {
            let name = if i % 2 == 0 { "outer" } else { "inner" };
            assert!(p.on_call_enter(f(name)));
        }
        assert_eq!(p.depth(), k);
        let report = p.disable().unwrap();
        assert_eq!(report.unwound_frames, k);
        assert_eq!(report.total_calls(), 1 + k as u64);
        assert_eq!(report.get("outer").unwrap().call_count, 1 + k.div_ceil(2) as u64);
        assert_eq!(p.depth(), 0);
    }
}

#[test]
fn second_disable_has_no_effect() {
    let mut p = enabled(&["foo"], Algorithm::Trie);
    let first = p.disable().unwrap();
    assert_eq!(first.total_calls(), 0);
    assert!(matches!(p.disable(), Err(Error::NotEnabled)));
    assert_eq!(p.state(), SessionState::Disabled);
    assert!(!p.on_call_enter(f("foo")));
}

#[test]
fn invariant_violation_is_fail_open() {
    let mut p = enabled(&["foo"], Algorithm::Hash);
    assert!(p.on_call_enter(f("foo")));
    assert!(p.on_call_enter(f("foo")));
    p.on_call_exit().unwrap();
    p.on_call_exit().unwrap();
    assert!(p.on_call_exit().unwrap_err().is_invariant_violation());

    // Further hooks are inert rather than failing the host.
    assert!(!p.on_call_enter(f("foo")));
    let report = p.disable().unwrap();
    assert_eq!(report.get("foo").unwrap().call_count, 2);

    // The controller can start over.
    p.enable(&Config::tracking(["foo"]).unwrap()).unwrap();
    assert!(p.on_call_enter(f("foo")));
    p.on_call_exit().unwrap();
    assert_eq!(p.disable().unwrap().get("foo").unwrap().call_count, 1);
}

#[test]
fn selector_slots_are_a_bijection_for_both_algorithms() {
    let mut rng = StdRng::seed_from_u64(7);
    let keys: Vec<FunctionKey> = (0..200)
        .map(|i| {
            let name = format!("fn_{}_{i}", rng.gen_range(0..1000));
            if i % 3 == 0 {
                FunctionKey::method(&format!("Type{}", i % 17), &name).unwrap()
            } else {
                FunctionKey::function(&name).unwrap()
            }
        })
        .collect();

    let (mut hash, distinct) = FunctionSelector::build(Algorithm::Hash, &keys).unwrap();
    let (mut trie, trie_distinct) = FunctionSelector::build(Algorithm::Trie, &keys).unwrap();
    assert_eq!(distinct, trie_distinct);

    for (i, key) in distinct.iter().enumerate() {
        let slot = i as u32 + 1;
        assert_eq!(hash.resolve(key.to_ref()), slot);
        assert_eq!(trie.resolve(key.to_ref()), slot);
    }
    for probe in ["fn_", "fn_1000_0", "Type1:", "nothing"] {
        let key = FunctionKey::parse(probe).map(|k| k.to_string()).unwrap_or_default();
        let r = FunctionRef::function(&key);
        assert_eq!(hash.resolve(r), trie.resolve(r));
        assert_eq!(trie.resolve(r), UNTRACKED, "{probe}");
    }
}
