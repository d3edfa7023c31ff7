use std::cell::Cell;
use std::rc::Rc;

use futures::executor::LocalPool;
use summon_core::RecordingRenderer;
use summon_core::prelude::*;

fn counter_screen(count: State<i32>) {
    restartable(move || {
        let value = count.get();
        node("column", Attrs::new(), || {
            node(
                "text",
                Attrs::new().with("value", format!("Count = {value}")),
                || {},
            );
            node("button", Attrs::new().with("label", "+1"), || {});
            if value >= 3 {
                keyed("badge", || {
                    node("text", Attrs::new().with("value", "Three or more!"), || {});
                    disposable_effect((), || {
                        log::info!("badge shown");
                        on_unmount(|| log::info!("badge hidden"))
                    });
                });
            }
        });

        launched_effect(value, move |scope| async move {
            if scope.is_active() {
                log::info!("count settled at {value}");
            }
        });
    });
}

fn status_line() {
    restartable(|| {
        let state = lifecycle_state();
        node(
            "text",
            Attrs::new().with("lifecycle", format!("{state:?}")),
            || {},
        );
    });
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let mut pool = LocalPool::new();
    let renderer = RecordingRenderer::new();
    let composition = Composition::new(renderer.clone(), pool.spawner());
    let owner = LifecycleOwner::new(pool.spawner());

    let frame_requested = Rc::new(Cell::new(false));
    let flag = frame_requested.clone();
    composition.on_invalidate(move || flag.set(true));

    let count = mutable_state_of(0);
    let (c, o) = (count.clone(), owner.clone());
    composition
        .set_content(move || {
            let c = c.clone();
            LOCAL_LIFECYCLE_OWNER.provides(o.clone(), move || {
                counter_screen(c);
                status_line();
            });
        })?
        .into_result()?;
    pool.run_until_stalled();
    println!("{}", renderer.dump());

    let _autosave = owner.when_active("autosave", |_token| async {
        log::info!("autosave running");
        futures::future::pending::<()>().await;
    });

    let mut frame = || -> anyhow::Result<()> {
        if frame_requested.replace(false) {
            let report = composition.run_until_idle()?;
            log::debug!(
                "frame: {} groups recomposed, {} effects",
                report.recomposed,
                report.effects_run
            );
            report.into_result()?;
        }
        pool.run_until_stalled();
        Ok(())
    };

    owner.transition(LifecycleState::Started)?;
    owner.transition(LifecycleState::Resumed)?;
    frame()?;

    for _ in 0..4 {
        count.update(|v| *v += 1);
        frame()?;
        println!("{}", renderer.dump());
    }

    count.set(0);
    owner.transition(LifecycleState::Paused)?;
    frame()?;
    println!("{}", renderer.dump());

    owner.destroy()?;
    frame()?;
    drop(frame);

    composition.dispose();
    for failure in composition.take_effect_failures() {
        log::error!("{:?} effect in {} failed: {}", failure.kind, failure.group, failure.message);
    }
    Ok(())
}
