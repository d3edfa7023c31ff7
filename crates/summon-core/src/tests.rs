use std::cell::{Cell, RefCell};
use std::panic::Location;
use std::rc::Rc;

use futures::executor::LocalPool;

use crate::*;

fn setup() -> (LocalPool, RecordingRenderer, Composition) {
    let pool = LocalPool::new();
    let renderer = RecordingRenderer::new();
    let composition = Composition::new(renderer.clone(), pool.spawner());
    (pool, renderer, composition)
}

fn counter() -> Rc<Cell<u32>> {
    Rc::new(Cell::new(0))
}

fn bump(c: &Cell<u32>) {
    c.set(c.get() + 1);
}

type Log = Rc<RefCell<Vec<String>>>;

fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn entries(log: &Log) -> Vec<String> {
    log.borrow().clone()
}

#[test]
fn test_repeated_reads_register_one_edge() {
    let (_pool, _renderer, composition) = setup();
    let s = mutable_state_of(1);

    let s2 = s.clone();
    composition
        .set_content(move || {
            let s = s2.clone();
            restartable(move || {
                let _ = s.get();
                let _ = s.get();
                s.with(|_| ());
            });
        })
        .unwrap();

    assert_eq!(s.observer_count(), 1);
}

#[test]
fn test_counter_writes_coalesce_into_one_recomposition() {
    let (_pool, renderer, composition) = setup();
    let count = mutable_state_of(0);
    let runs = counter();
    let invalidations = counter();

    let inv = invalidations.clone();
    composition.on_invalidate(move || bump(&inv));

    let (c, r) = (count.clone(), runs.clone());
    composition
        .set_content(move || {
            let (c, r) = (c.clone(), r.clone());
            restartable(move || {
                bump(&r);
                node("text", Attrs::new().with("value", c.get()), || {});
            });
        })
        .unwrap();
    assert_eq!(renderer.dump(), "text value=\"0\"\n");

    count.set(1);
    count.update(|v| *v += 1);
    count.set(3);
    assert_eq!(invalidations.get(), 1);
    assert!(composition.has_pending_changes());

    let report = composition.recompose().unwrap();
    assert_eq!(report.recomposed, 1);
    assert!(report.is_clean());
    assert_eq!(runs.get(), 2);
    assert_eq!(renderer.dump(), "text value=\"3\"\n");
    assert!(!composition.has_pending_changes());

    // Nothing dirty: the pass is a no-op.
    assert_eq!(composition.recompose().unwrap().recomposed, 0);
    assert_eq!(runs.get(), 2);
}

#[test]
fn test_changed_compares_with_previous_value() {
    let (_pool, _renderer, composition) = setup();
    let value = mutable_state_of(1);
    let tick = mutable_state_of(0);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let (v, t, out) = (value.clone(), tick.clone(), seen.clone());
    composition
        .set_content(move || {
            let (v, t, out) = (v.clone(), t.clone(), out.clone());
            restartable(move || {
                let _ = t.get();
                out.borrow_mut().push(changed(&v.get()));
            });
        })
        .unwrap();

    tick.set(1);
    composition.recompose().unwrap();
    value.set(5);
    composition.recompose().unwrap();
    tick.set(2);
    composition.recompose().unwrap();

    assert_eq!(*seen.borrow(), vec![true, false, true, false]);
}

#[test]
fn test_remember_survives_recomposition() {
    let (_pool, _renderer, composition) = setup();
    let tick = mutable_state_of(0);
    let inits = counter();
    let values = Rc::new(RefCell::new(Vec::new()));

    let (t, i, vals) = (tick.clone(), inits.clone(), values.clone());
    composition
        .set_content(move || {
            let (t, i, vals) = (t.clone(), i.clone(), vals.clone());
            restartable(move || {
                let _ = t.get();
                let cell = remember(|| {
                    bump(&i);
                    Rc::new(Cell::new(0u32))
                });
                bump(&cell);
                vals.borrow_mut().push(cell.get());
            });
        })
        .unwrap();

    for n in 1..=3 {
        tick.set(n);
        composition.recompose().unwrap();
    }

    assert_eq!(inits.get(), 1);
    assert_eq!(*values.borrow(), vec![1, 2, 3, 4]);
}

#[test]
fn test_remember_keyed_recomputes_on_key_change() {
    let (_pool, _renderer, composition) = setup();
    let key = mutable_state_of("a");
    let inits = counter();

    let (k, i) = (key.clone(), inits.clone());
    composition
        .set_content(move || {
            let (k, i) = (k.clone(), i.clone());
            restartable(move || {
                let key = k.get();
                remember_keyed(key, || bump(&i));
            });
        })
        .unwrap();

    key.set("a");
    composition.recompose().unwrap();
    assert_eq!(inits.get(), 1);

    key.set("b");
    composition.recompose().unwrap();
    assert_eq!(inits.get(), 2);
}

#[test]
fn test_only_dirty_groups_recompose() {
    let (_pool, _renderer, composition) = setup();
    let a = mutable_state_of(0);
    let b = mutable_state_of(0);
    let (a_runs, b_runs, root_runs) = (counter(), counter(), counter());

    let (a2, b2, ar, br, rr) = (
        a.clone(),
        b.clone(),
        a_runs.clone(),
        b_runs.clone(),
        root_runs.clone(),
    );
    composition
        .set_content(move || {
            bump(&rr);
            let (a, ar) = (a2.clone(), ar.clone());
            restartable(move || {
                bump(&ar);
                let _ = a.get();
            });
            let (b, br) = (b2.clone(), br.clone());
            restartable(move || {
                bump(&br);
                let _ = b.get();
            });
        })
        .unwrap();

    a.set(1);
    let report = composition.recompose().unwrap();

    assert_eq!(report.recomposed, 1);
    assert_eq!(root_runs.get(), 1);
    assert_eq!(a_runs.get(), 2);
    assert_eq!(b_runs.get(), 1);
    assert_eq!(composition.total_recompositions(), 1);
}

#[test]
fn test_parent_recomposes_before_child() {
    let (_pool, _renderer, composition) = setup();
    let outer = mutable_state_of(0);
    let inner = mutable_state_of(0);
    let order = log();

    let (o, i, l) = (outer.clone(), inner.clone(), order.clone());
    composition
        .set_content(move || {
            let (o, i, l) = (o.clone(), i.clone(), l.clone());
            restartable(move || {
                let _ = o.get();
                l.borrow_mut().push("parent".into());
                let (i, l) = (i.clone(), l.clone());
                restartable(move || {
                    let _ = i.get();
                    l.borrow_mut().push("child".into());
                });
            });
        })
        .unwrap();
    order.borrow_mut().clear();

    // Child written first; it still runs after its parent, and only once.
    inner.set(1);
    outer.set(1);
    let report = composition.recompose().unwrap();

    assert_eq!(entries(&order), vec!["parent", "child"]);
    assert_eq!(report.recomposed, 1);
}

#[test]
fn test_keyed_children_keep_state_on_reorder() {
    let (_pool, _renderer, composition) = setup();
    let items = mutable_state_of(vec![1u32, 2, 3]);
    let seen = log();
    let disposed = log();

    let (it, s, d) = (items.clone(), seen.clone(), disposed.clone());
    composition
        .set_content(move || {
            let (it, s, d) = (it.clone(), s.clone(), d.clone());
            restartable(move || {
                for id in it.get() {
                    keyed(id, || {
                        let tag = remember(|| format!("item-{id}"));
                        s.borrow_mut().push(tag.clone());
                        let d = d.clone();
                        disposable_effect((), move || Dispose::new(move || d.borrow_mut().push(tag)));
                    });
                }
            });
        })
        .unwrap();

    seen.borrow_mut().clear();
    items.set(vec![3, 1]);
    composition.recompose().unwrap();

    assert_eq!(entries(&seen), vec!["item-3", "item-1"]);
    assert_eq!(entries(&disposed), vec!["item-2"]);
}

#[test]
fn test_positional_children_swap_state_on_reorder() {
    let (_pool, _renderer, composition) = setup();
    let items = mutable_state_of(vec![1u32, 2]);
    let seen = log();

    let (it, s) = (items.clone(), seen.clone());
    composition
        .set_content(move || {
            let (it, s) = (it.clone(), s.clone());
            restartable(move || {
                for id in it.get() {
                    group(|| {
                        let tag = remember(|| format!("item-{id}"));
                        s.borrow_mut().push(tag);
                    });
                }
            });
        })
        .unwrap();

    seen.borrow_mut().clear();
    items.set(vec![2, 1]);
    composition.recompose().unwrap();

    assert_eq!(entries(&seen), vec!["item-1", "item-2"]);
}

#[test]
fn test_duplicate_call_site_rejected_by_strict_policy() {
    let pool = LocalPool::new();
    let config = CompositionConfig::default().with_key_policy(KeyPolicy::RequireExplicitInLoops);
    let composition = Composition::with_config(RecordingRenderer::new(), pool.spawner(), config);

    let report = composition
        .set_content(|| {
            for _ in 0..2 {
                group(|| {});
            }
        })
        .unwrap();

    assert!(matches!(report.errors.as_slice(), [RuntimeError::DuplicateKey { .. }]));
    assert!(report.into_result().is_err());
}

#[test]
fn test_removed_group_disposes_exactly_once() {
    let (_pool, _renderer, composition) = setup();
    let show = mutable_state_of(true);
    let (setups, cleanups) = (counter(), counter());

    let (sh, su, cl) = (show.clone(), setups.clone(), cleanups.clone());
    composition
        .set_content(move || {
            let (sh, su, cl) = (sh.clone(), su.clone(), cl.clone());
            restartable(move || {
                if sh.get() {
                    keyed("panel", || {
                        let (su, cl) = (su.clone(), cl.clone());
                        disposable_effect((), move || {
                            bump(&su);
                            Dispose::new(move || bump(&cl))
                        });
                    });
                }
            });
        })
        .unwrap();
    assert_eq!((setups.get(), cleanups.get()), (1, 0));

    show.set(false);
    composition.recompose().unwrap();
    assert_eq!((setups.get(), cleanups.get()), (1, 1));

    composition.dispose();
    assert_eq!(cleanups.get(), 1);
}

#[test]
fn test_dispose_runs_disposables_of_never_recomposed_groups_once() {
    let (_pool, _renderer, composition) = setup();
    let cleanups = counter();

    let cl = cleanups.clone();
    composition
        .set_content(move || {
            let cl = cl.clone();
            current_composer()
                .unwrap()
                .register_disposable(move || bump(&cl))
                .unwrap();
        })
        .unwrap();

    composition.dispose();
    composition.dispose();
    assert_eq!(cleanups.get(), 1);
    assert!(composition.is_disposed());
    assert!(matches!(composition.recompose(), Err(RuntimeError::Disposed)));
    assert!(matches!(composition.set_content(|| {}), Err(RuntimeError::Disposed)));
}

#[test]
fn test_cleanup_runs_children_first_then_registration_order() {
    let (_pool, _renderer, composition) = setup();
    let order = log();

    let l = order.clone();
    composition
        .set_content(move || {
            let l = l.clone();
            restartable(move || {
                let cleanup = |name: &'static str| {
                    let l = l.clone();
                    move || Dispose::new(move || l.borrow_mut().push(name.into()))
                };
                disposable_effect("p1", cleanup("p1"));
                let child = cleanup("child");
                restartable(move || disposable_effect((), child.clone()));
                disposable_effect("p2", cleanup("p2"));
            });
        })
        .unwrap();

    drop(composition);
    assert_eq!(entries(&order), vec!["child", "p1", "p2"]);
}

#[test]
fn test_conditional_remember_fails_fast_and_spares_siblings() {
    let (_pool, _renderer, composition) = setup();
    let flag = mutable_state_of(false);
    let other = mutable_state_of(0);
    let other_runs = counter();

    let (f, o, r) = (flag.clone(), other.clone(), other_runs.clone());
    composition
        .set_content(move || {
            let f = f.clone();
            restartable(move || {
                if f.get() {
                    remember(|| 1u8);
                }
                remember(|| "label");
            });
            let (o, r) = (o.clone(), r.clone());
            restartable(move || {
                let _ = o.get();
                bump(&r);
            });
        })
        .unwrap();

    flag.set(true);
    other.set(1);
    let report = composition.recompose().unwrap();

    assert_eq!(report.errors.len(), 1);
    match &report.errors[0] {
        RuntimeError::SlotTypeMismatch {
            index,
            expected,
            found,
            ..
        } => {
            assert_eq!(*index, 0);
            assert_eq!(*expected, "u8");
            assert_eq!(*found, "&str");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(other_runs.get(), 2);
}

#[test]
fn test_slot_count_change_is_reported() {
    let (_pool, _renderer, composition) = setup();
    let flag = mutable_state_of(false);

    let f = flag.clone();
    composition
        .set_content(move || {
            let f = f.clone();
            restartable(move || {
                if f.get() {
                    remember(|| 1u8);
                }
            });
        })
        .unwrap();

    flag.set(true);
    let report = composition.recompose().unwrap();
    assert!(matches!(
        report.errors.as_slice(),
        [RuntimeError::SlotCountMismatch {
            expected: 0,
            found: 1,
            ..
        }]
    ));
}

#[test]
fn test_composable_panic_is_contained() {
    let (_pool, _renderer, composition) = setup();
    let boom = mutable_state_of(false);
    let effects = counter();

    let (b, e) = (boom.clone(), effects.clone());
    composition
        .set_content(move || {
            let (b, e) = (b.clone(), e.clone());
            restartable(move || {
                let e = e.clone();
                side_effect(move || bump(&e));
                if b.get() {
                    panic!("render failed");
                }
            });
        })
        .unwrap();
    assert_eq!(effects.get(), 1);

    boom.set(true);
    let report = composition.recompose().unwrap();
    assert!(matches!(
        &report.errors[..],
        [RuntimeError::ComposablePanicked { message, .. }] if message == "render failed"
    ));
    // Effects of a failed group are dropped.
    assert_eq!(effects.get(), 1);

    boom.set(false);
    assert!(composition.recompose().unwrap().is_clean());
    assert_eq!(effects.get(), 2);
}

#[test]
fn test_disposable_effect_cleans_up_before_new_setup() {
    let (_pool, _renderer, composition) = setup();
    let key = mutable_state_of("listener");
    let tick = mutable_state_of(0);
    let events = log();

    let (k, t, ev) = (key.clone(), tick.clone(), events.clone());
    composition
        .set_content(move || {
            let (k, t, ev) = (k.clone(), t.clone(), ev.clone());
            restartable(move || {
                let _ = t.get();
                let name = k.get();
                let ev = ev.clone();
                disposable_effect(name, move || {
                    ev.borrow_mut().push(format!("setup {name}"));
                    Dispose::new(move || ev.borrow_mut().push(format!("cleanup {name}")))
                });
            });
        })
        .unwrap();

    // Unchanged keys: no cleanup, no setup.
    tick.set(1);
    composition.recompose().unwrap();
    assert_eq!(entries(&events), vec!["setup listener"]);

    key.set("listener-2");
    composition.recompose().unwrap();
    assert_eq!(
        entries(&events),
        vec!["setup listener", "cleanup listener", "setup listener-2"]
    );

    composition.dispose();
    assert_eq!(entries(&events).last().unwrap(), "cleanup listener-2");
}

#[test]
fn test_side_effect_runs_after_every_pass() {
    let (_pool, renderer, composition) = setup();
    let tick = mutable_state_of(0);
    let observed = log();

    let (t, obs, rec) = (tick.clone(), observed.clone(), renderer.clone());
    composition
        .set_content(move || {
            let (t, obs, rec) = (t.clone(), obs.clone(), rec.clone());
            restartable(move || {
                node("text", Attrs::new().with("value", t.get()), || {});
                let (obs, rec) = (obs.clone(), rec.clone());
                // Effects see the settled tree.
                side_effect(move || obs.borrow_mut().push(rec.dump()));
            });
        })
        .unwrap();

    tick.set(1);
    composition.recompose().unwrap();

    assert_eq!(
        entries(&observed),
        vec!["text value=\"0\"\n", "text value=\"1\"\n"]
    );
}

#[test]
fn test_failing_effect_does_not_stop_others() {
    let (_pool, _renderer, composition) = setup();
    let ran = counter();

    let r = ran.clone();
    let report = composition
        .set_content(move || {
            restartable(|| side_effect(|| panic!("sync failed")));
            let r = r.clone();
            restartable(move || {
                let r = r.clone();
                side_effect(move || bump(&r));
            });
        })
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.effects_run, 2);
    assert_eq!(ran.get(), 1);
    let failures = composition.take_effect_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind, EffectKind::Side);
    assert_eq!(failures[0].message, "sync failed");
    assert!(composition.take_effect_failures().is_empty());
}

#[test]
fn test_launched_effect_runs_once_per_key_and_cancels_on_change() {
    let (mut pool, _renderer, composition) = setup();
    let key = mutable_state_of(1);
    let tick = mutable_state_of(0);
    let starts = counter();
    let tokens: Rc<RefCell<Vec<CancellationToken>>> = Rc::default();

    let (k, t, s, tk) = (key.clone(), tick.clone(), starts.clone(), tokens.clone());
    composition
        .set_content(move || {
            let (k, t, s, tk) = (k.clone(), t.clone(), s.clone(), tk.clone());
            restartable(move || {
                let _ = t.get();
                let (s, tk) = (s.clone(), tk.clone());
                launched_effect(k.get(), move |scope| async move {
                    bump(&s);
                    tk.borrow_mut().push(scope.token().clone());
                    futures::future::pending::<()>().await;
                });
            });
        })
        .unwrap();
    pool.run_until_stalled();
    assert_eq!(starts.get(), 1);

    tick.set(1);
    composition.recompose().unwrap();
    pool.run_until_stalled();
    assert_eq!(starts.get(), 1);

    key.set(2);
    composition.recompose().unwrap();
    pool.run_until_stalled();
    assert_eq!(starts.get(), 2);
    {
        let tokens = tokens.borrow();
        assert!(tokens[0].is_cancelled());
        assert!(!tokens[1].is_cancelled());
    }

    composition.dispose();
    pool.run_until_stalled();
    assert!(tokens.borrow()[1].is_cancelled());
    // Cancellation is not a failure.
    assert!(composition.take_effect_failures().is_empty());
}

#[test]
fn test_removed_branch_cancels_its_launched_effect() {
    let (mut pool, _renderer, composition) = setup();
    let show = mutable_state_of(true);
    let tokens: Rc<RefCell<Vec<CancellationToken>>> = Rc::default();
    let stopped = counter();

    let (sh, tk, st) = (show.clone(), tokens.clone(), stopped.clone());
    composition
        .set_content(move || {
            let (sh, tk, st) = (sh.clone(), tk.clone(), st.clone());
            restartable(move || {
                if sh.get() {
                    let (tk, st) = (tk.clone(), st.clone());
                    keyed("sync", move || {
                        launched_effect((), move |scope| async move {
                            tk.borrow_mut().push(scope.token().clone());
                            scope.cancelled().await;
                            bump(&st);
                        });
                    });
                }
            });
        })
        .unwrap();
    pool.run_until_stalled();
    assert_eq!(tokens.borrow().len(), 1);
    assert!(!tokens.borrow()[0].is_cancelled());

    show.set(false);
    composition.recompose().unwrap();
    assert!(!composition.is_disposed());
    assert!(tokens.borrow()[0].is_cancelled());
    pool.run_until_stalled();
    assert_eq!(stopped.get(), 0);
    assert!(composition.take_effect_failures().is_empty());
}

#[test]
fn test_failed_first_pass_registers_effect_cleanup_once() {
    let (mut pool, _renderer, composition) = setup();
    let ready = mutable_state_of(false);
    let tick = mutable_state_of(0);
    let calls = log();

    let (r, t, c) = (ready.clone(), tick.clone(), calls.clone());
    let report = composition
        .set_content(move || {
            let (r, t, c) = (r.clone(), t.clone(), c.clone());
            restartable(move || {
                let _ = t.get();
                let c = c.clone();
                disposable_effect((), move || {
                    c.borrow_mut().push("setup".to_string());
                    Dispose::new(move || c.borrow_mut().push("cleanup".to_string()))
                });
                launched_effect((), |_scope| futures::future::pending::<()>());
                if !r.get() {
                    panic!("not ready");
                }
            });
        })
        .unwrap();
    assert!(!report.is_clean());

    for i in 1..=3 {
        tick.set(i);
        assert!(!composition.recompose().unwrap().is_clean());
    }
    assert_eq!(composition.disposable_count(), 2);
    assert!(entries(&calls).is_empty());

    ready.set(true);
    assert!(composition.recompose().unwrap().is_clean());
    pool.run_until_stalled();
    assert_eq!(entries(&calls), vec!["setup"]);
    assert_eq!(composition.disposable_count(), 2);

    composition.dispose();
    assert_eq!(entries(&calls), vec!["setup", "cleanup"]);
}

#[test]
fn test_launched_effect_failure_is_reported() {
    let (mut pool, _renderer, composition) = setup();

    composition
        .set_content(|| {
            restartable(|| {
                launched_effect("load", |_scope| async { Err::<(), _>("backend unavailable") });
            });
            restartable(|| {
                launched_effect("crash", |_scope| async {
                    if true {
                        panic!("task panicked");
                    }
                });
            });
        })
        .unwrap();
    pool.run_until_stalled();

    let mut messages: Vec<String> = composition
        .take_effect_failures()
        .into_iter()
        .inspect(|f| assert_eq!(f.kind, EffectKind::Launched))
        .map(|f| f.message)
        .collect();
    messages.sort();
    assert_eq!(messages, vec!["backend unavailable", "task panicked"]);
}

#[test]
fn test_launch_without_launcher_is_an_effect_failure() {
    let composition = Composition::new(RecordingRenderer::new(), NoLauncher);
    composition
        .set_content(|| {
            restartable(|| launched_effect((), |_scope| async {}));
        })
        .unwrap();

    let failures = composition.take_effect_failures();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].message.contains("no launcher configured"));
}

static LOCAL_NAME: CompositionLocal<&'static str> = CompositionLocal::new("LocalName");
static LOCAL_SCALE: CompositionLocal<u32> = CompositionLocal::with_default("LocalScale", || 1);

#[test]
fn test_nested_provides_restore_outer_value() {
    let (_pool, _renderer, composition) = setup();
    let seen = log();

    let s = seen.clone();
    composition
        .set_content(move || {
            LOCAL_NAME.provides("A", || {
                s.borrow_mut().push(LOCAL_NAME.current().into());
                LOCAL_NAME.provides("B", || s.borrow_mut().push(LOCAL_NAME.current().into()));
                s.borrow_mut().push(LOCAL_NAME.current().into());
            });
        })
        .unwrap();

    assert_eq!(entries(&seen), vec!["A", "B", "A"]);
    assert_eq!(LOCAL_SCALE.current(), 1);
    assert_eq!(
        LOCAL_NAME.try_current(),
        Err(RuntimeError::MissingProvider { name: "LocalName" })
    );
}

#[test]
fn test_restarted_group_sees_provided_locals() {
    let (_pool, _renderer, composition) = setup();
    let tick = mutable_state_of(0);
    let seen = log();

    let (t, s) = (tick.clone(), seen.clone());
    composition
        .set_content(move || {
            let (t, s) = (t.clone(), s.clone());
            LOCAL_NAME.provides("outer", move || {
                restartable(move || {
                    let _ = t.get();
                    s.borrow_mut().push(LOCAL_NAME.current().into());
                });
            });
        })
        .unwrap();

    tick.set(1);
    composition.recompose().unwrap();
    assert_eq!(entries(&seen), vec!["outer", "outer"]);
}

#[test]
fn test_missing_provider_fails_the_reading_group() {
    let (_pool, _renderer, composition) = setup();
    let report = composition
        .set_content(|| {
            restartable(|| {
                let _ = LOCAL_NAME.current();
            });
        })
        .unwrap();

    assert_eq!(
        report.errors,
        vec![RuntimeError::MissingProvider { name: "LocalName" }]
    );
}

#[test]
fn test_derived_state_recomputes_only_after_upstream_writes() {
    let first = mutable_state_of(2);
    let second = mutable_state_of(3);
    let (f, s) = (first.clone(), second.clone());
    let sum = derived_state_of(move || f.get() + s.get());

    assert_eq!(sum.get(), 5);
    assert_eq!(sum.get(), 5);
    assert_eq!(sum.computations(), 1);

    first.set(10);
    second.set(1);
    assert_eq!(sum.get(), 11);
    assert_eq!(sum.computations(), 2);
}

#[test]
fn test_derived_state_invalidates_readers() {
    let (_pool, _renderer, composition) = setup();
    let count = mutable_state_of(1);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let (c, out) = (count.clone(), seen.clone());
    composition
        .set_content(move || {
            let (c, out) = (c.clone(), out.clone());
            restartable(move || {
                let c = c.clone();
                let doubled = remember_derived(move || c.get() * 2);
                out.borrow_mut().push(doubled.get());
            });
        })
        .unwrap();

    count.set(4);
    composition.recompose().unwrap();
    assert_eq!(*seen.borrow(), vec![2, 8]);
    assert_eq!(count.observer_count(), 1);
}

#[test]
fn test_untracked_reads_do_not_subscribe() {
    let (_pool, _renderer, composition) = setup();
    let s = mutable_state_of(0);

    let s2 = s.clone();
    composition
        .set_content(move || {
            let s = s2.clone();
            restartable(move || {
                let _ = untracked(|| s.get());
                let _ = s.get_untracked();
            });
        })
        .unwrap();

    s.set(1);
    assert_eq!(s.observer_count(), 0);
    assert!(!composition.has_pending_changes());
}

#[test]
fn test_writes_during_composition_settle_in_later_passes() {
    let (_pool, _renderer, composition) = setup();
    let s = mutable_state_of(0);

    let s2 = s.clone();
    composition
        .set_content(move || {
            let s = s2.clone();
            restartable(move || {
                if s.get() < 3 {
                    s.set(s.get_untracked() + 1);
                }
            });
        })
        .unwrap();

    let report = composition.run_until_idle().unwrap();
    assert_eq!(report.recomposed, 3);
    assert_eq!(s.get_untracked(), 3);
}

#[test]
fn test_run_until_idle_is_bounded() {
    let pool = LocalPool::new();
    let config = CompositionConfig::default().with_max_settle_passes(4);
    let composition = Composition::with_config(RecordingRenderer::new(), pool.spawner(), config);
    let s = mutable_state_of(0);

    let s2 = s.clone();
    composition
        .set_content(move || {
            let s = s2.clone();
            restartable(move || {
                let v = s.get();
                s.set(v + 1);
            });
        })
        .unwrap();

    assert_eq!(
        composition.run_until_idle().unwrap_err(),
        RuntimeError::Unsettled {
            passes: 4,
            errors: vec![],
        }
    );
}

#[test]
fn test_unsettled_error_keeps_group_failures() {
    let pool = LocalPool::new();
    let config = CompositionConfig::default().with_max_settle_passes(4);
    let composition = Composition::with_config(RecordingRenderer::new(), pool.spawner(), config);
    let s = mutable_state_of(0);

    let s2 = s.clone();
    composition
        .set_content(move || {
            let s = s2.clone();
            restartable(move || {
                let v = s.get();
                s.set(v + 1);
                if v >= 2 {
                    panic!("overflow");
                }
            });
        })
        .unwrap();

    let Err(RuntimeError::Unsettled { passes, errors }) = composition.run_until_idle() else {
        panic!("expected an unsettled error");
    };
    assert_eq!(passes, 4);
    assert_eq!(errors.len(), 3);
    assert!(errors.iter().all(|e| matches!(
        e,
        RuntimeError::ComposablePanicked { message, .. } if message == "overflow"
    )));
}

#[test]
fn test_update_may_read_the_same_state() {
    let s = mutable_state_of(2);
    s.update(|v| *v += s.get_untracked());
    assert_eq!(s.get_untracked(), 4);
    s.update(|v| *v = s.with(|old| old * 10));
    assert_eq!(s.get_untracked(), 40);
}

#[test]
fn test_nodes_are_created_updated_and_removed() {
    let (_pool, renderer, composition) = setup();
    let label = mutable_state_of("Save");
    let show_button = mutable_state_of(true);

    let (l, sb) = (label.clone(), show_button.clone());
    composition
        .set_content(move || {
            let (l, sb) = (l.clone(), sb.clone());
            restartable(move || {
                node("column", Attrs::new(), || {
                    node("text", Attrs::new().with("value", "Title"), || {});
                    if sb.get() {
                        keyed("button", || {
                            node("button", Attrs::new().with("label", l.get()), || {});
                        });
                    }
                });
            });
        })
        .unwrap();
    assert_eq!(
        renderer.dump(),
        "column\n  text value=\"Title\"\n  button label=\"Save\"\n"
    );
    assert_eq!(renderer.node_count(), 3);

    renderer.clear_ops();
    label.set("Saved");
    composition.recompose().unwrap();
    assert_eq!(renderer.ops(), vec![RenderOp::Update { kind: "button" }]);

    renderer.clear_ops();
    show_button.set(false);
    composition.recompose().unwrap();
    assert_eq!(renderer.ops(), vec![RenderOp::Remove { kind: "button" }]);
    assert_eq!(renderer.dump(), "column\n  text value=\"Title\"\n");

    composition.dispose();
    assert_eq!(renderer.node_count(), 0);
}

#[test]
fn test_node_kind_change_recreates_children() {
    let (_pool, renderer, composition) = setup();
    let horizontal = mutable_state_of(false);

    let h = horizontal.clone();
    composition
        .set_content(move || {
            let h = h.clone();
            restartable(move || {
                let kind = if h.get() { "row" } else { "column" };
                node(kind, Attrs::new(), || {
                    node("text", Attrs::new().with("value", "hi"), || {});
                });
            });
        })
        .unwrap();
    assert_eq!(renderer.dump(), "column\n  text value=\"hi\"\n");

    renderer.clear_ops();
    horizontal.set(true);
    composition.recompose().unwrap();
    assert_eq!(renderer.dump(), "row\n  text value=\"hi\"\n");
    assert_eq!(
        renderer.ops(),
        vec![
            RenderOp::Remove { kind: "column" },
            RenderOp::Create { kind: "row" },
            RenderOp::Create { kind: "text" },
        ]
    );
    assert_eq!(renderer.node_count(), 2);

    renderer.clear_ops();
    horizontal.set(false);
    composition.recompose().unwrap();
    assert_eq!(renderer.dump(), "column\n  text value=\"hi\"\n");

    composition.dispose();
    assert_eq!(renderer.node_count(), 0);
}

#[test]
fn test_new_nodes_follow_composition_order() {
    let (_pool, renderer, composition) = setup();
    let show_first = mutable_state_of(false);
    let items = mutable_state_of(vec!["c", "d"]);

    let (sf, it) = (show_first.clone(), items.clone());
    composition
        .set_content(move || {
            let (sf, it) = (sf.clone(), it.clone());
            restartable(move || {
                node("column", Attrs::new(), || {
                    if sf.get() {
                        keyed("a", || {
                            node("a", Attrs::new(), || {});
                        });
                    }
                    node("b", Attrs::new(), || {});
                    for item in it.get() {
                        keyed(item, || {
                            node(item, Attrs::new(), || {});
                        });
                    }
                });
            });
        })
        .unwrap();
    assert_eq!(renderer.dump(), "column\n  b\n  c\n  d\n");

    show_first.set(true);
    composition.recompose().unwrap();
    assert_eq!(renderer.dump(), "column\n  a\n  b\n  c\n  d\n");

    // A removal and an insertion in the same pass.
    items.set(vec!["d", "e"]);
    composition.recompose().unwrap();
    assert_eq!(renderer.dump(), "column\n  a\n  b\n  d\n  e\n");

    show_first.set(false);
    composition.recompose().unwrap();
    assert_eq!(renderer.dump(), "column\n  b\n  d\n  e\n");
}

#[test]
fn test_restarted_child_inserts_between_siblings() {
    let (_pool, renderer, composition) = setup();
    let show_middle = mutable_state_of(false);
    let outer_runs = counter();

    let (sm, runs) = (show_middle.clone(), outer_runs.clone());
    composition
        .set_content(move || {
            let (sm, runs) = (sm.clone(), runs.clone());
            restartable(move || {
                bump(&runs);
                let sm = sm.clone();
                node("column", Attrs::new(), move || {
                    node("a", Attrs::new(), || {});
                    restartable(move || {
                        if sm.get() {
                            node("b", Attrs::new(), || {});
                        }
                    });
                    node("c", Attrs::new(), || {});
                });
            });
        })
        .unwrap();
    assert_eq!(renderer.dump(), "column\n  a\n  c\n");

    show_middle.set(true);
    let report = composition.recompose().unwrap();
    assert_eq!(report.recomposed, 1);
    assert_eq!(outer_runs.get(), 1);
    assert_eq!(renderer.dump(), "column\n  a\n  b\n  c\n");
}

#[test]
fn test_composer_slot_api() {
    let (_pool, _renderer, composition) = setup();
    let tick = mutable_state_of(0);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let (t, out) = (tick.clone(), seen.clone());
    composition
        .set_content(move || {
            let (t, out) = (t.clone(), out.clone());
            restartable(move || {
                let _ = t.get();
                let composer = current_composer().unwrap();
                composer
                    .start_group(GroupKey::keyed(Location::caller(), &"manual"))
                    .unwrap();
                let inserting = composer.is_inserting();
                let index = composer.next_slot().unwrap();
                let previous = composer.get_slot::<u32>(index).unwrap();
                composer
                    .set_slot(index, previous.unwrap_or(0) + 1)
                    .unwrap();
                composer.end_group().unwrap();
                out.borrow_mut().push((inserting, previous));
            });
        })
        .unwrap();

    tick.set(1);
    composition.recompose().unwrap();
    assert_eq!(*seen.borrow(), vec![(true, None), (false, Some(1))]);
    assert!(matches!(
        current_composer(),
        Err(RuntimeError::NotComposing { .. })
    ));
}

#[test]
fn test_lifecycle_when_active_follows_resume_and_pause() {
    let mut pool = LocalPool::new();
    let owner = LifecycleOwner::new(pool.spawner());
    let runs = counter();
    let tokens: Rc<RefCell<Vec<CancellationToken>>> = Rc::default();

    owner.transition(LifecycleState::Started).unwrap();
    owner.transition(LifecycleState::Resumed).unwrap();

    let (r, tk) = (runs.clone(), tokens.clone());
    let _registration = owner.when_active("sync", move |token| {
        bump(&r);
        tk.borrow_mut().push(token);
        futures::future::pending::<()>()
    });
    pool.run_until_stalled();
    assert_eq!(runs.get(), 1);

    owner.transition(LifecycleState::Paused).unwrap();
    pool.run_until_stalled();
    assert!(tokens.borrow()[0].is_cancelled());
    assert_eq!(runs.get(), 1);

    owner.transition(LifecycleState::Resumed).unwrap();
    pool.run_until_stalled();
    assert_eq!(runs.get(), 2);
    assert!(!tokens.borrow()[1].is_cancelled());

    owner.transition(LifecycleState::Paused).unwrap();
    owner.destroy().unwrap();
    pool.run_until_stalled();
    assert_eq!(runs.get(), 2);
    assert!(tokens.borrow()[1].is_cancelled());
    assert_eq!(owner.state(), LifecycleState::Destroyed);
    assert_eq!(
        owner.transition(LifecycleState::Started),
        Err(LifecycleError::Destroyed)
    );
}

#[test]
fn test_when_active_replaces_blocks_with_the_same_key() {
    let mut pool = LocalPool::new();
    let owner = LifecycleOwner::new(pool.spawner());
    owner.transition(LifecycleState::Started).unwrap();
    let runs = log();

    let r = runs.clone();
    let first = owner.when_active("poll", move |_| {
        r.borrow_mut().push("first".into());
        futures::future::pending::<()>()
    });
    let r = runs.clone();
    let _second = owner.when_active("poll", move |_| {
        r.borrow_mut().push("second".into());
        futures::future::ready(())
    });
    pool.run_until_stalled();
    // The superseded guard no longer refers to anything.
    first.run();

    owner.transition(LifecycleState::Resumed).unwrap();
    owner.transition(LifecycleState::Paused).unwrap();
    owner.transition(LifecycleState::Started).unwrap();
    pool.run_until_stalled();
    assert_eq!(entries(&runs), vec!["second", "second"]);
}

#[test]
fn test_invalid_lifecycle_transitions_are_rejected() {
    let owner = LifecycleOwner::new(NoLauncher);
    assert_eq!(
        owner.transition(LifecycleState::Resumed),
        Err(LifecycleError::InvalidTransition {
            from: LifecycleState::Created,
            to: LifecycleState::Resumed,
        })
    );
    owner.transition(LifecycleState::Started).unwrap();
    assert!(owner.transition(LifecycleState::Created).is_err());
    assert!(owner.transition(LifecycleState::Paused).is_err());
    assert_eq!(owner.state(), LifecycleState::Started);
}

#[test]
fn test_lifecycle_observers_are_isolated_and_ordered() {
    let owner = LifecycleOwner::new(NoLauncher);
    let calls = log();

    let c = calls.clone();
    let _a = owner.observe(move |_, to| c.borrow_mut().push(format!("a {to:?}")));
    let _b = owner.observe(|_, _| panic!("observer failed"));
    let c = calls.clone();
    let third = owner.observe(move |from, to| c.borrow_mut().push(format!("c {from:?}->{to:?}")));

    owner.transition(LifecycleState::Started).unwrap();
    third.run();
    owner.transition(LifecycleState::Resumed).unwrap();

    assert_eq!(
        entries(&calls),
        vec!["a Started", "c Created->Started", "a Resumed"]
    );
}

#[test]
fn test_lifecycle_scope_is_cancelled_on_destroy() {
    let mut pool = LocalPool::new();
    let owner = LifecycleOwner::new(pool.spawner());
    let scope = owner.lifecycle_scope();
    let finished = counter();

    let job = scope
        .launch(futures::future::pending::<()>())
        .unwrap();
    let f = finished.clone();
    scope.launch(async move { bump(&f) }).unwrap();
    pool.run_until_stalled();
    assert_eq!(finished.get(), 1);
    assert!(!job.is_cancelled());

    owner.destroy().unwrap();
    assert!(job.is_cancelled());
    assert!(!scope.is_active());
    assert!(matches!(
        scope.launch(async {}),
        Err(RuntimeError::Launch(_))
    ));
    pool.run();
}

#[test]
fn test_lifecycle_state_recomposes_readers() {
    let (_pool, _renderer, composition) = setup();
    let owner = LifecycleOwner::new(NoLauncher);
    let seen = Rc::new(RefCell::new(Vec::new()));

    let (o, out) = (owner.clone(), seen.clone());
    composition
        .set_content(move || {
            let out = out.clone();
            LOCAL_LIFECYCLE_OWNER.provides(o.clone(), move || {
                restartable(move || out.borrow_mut().push(lifecycle_state()));
            });
        })
        .unwrap();

    owner.transition(LifecycleState::Started).unwrap();
    assert!(composition.has_pending_changes());
    composition.recompose().unwrap();
    assert_eq!(
        *seen.borrow(),
        vec![LifecycleState::Created, LifecycleState::Started]
    );
}
