use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log_pipeline::markup::strip_ansi;
use log_pipeline::{
    Completion, Destination, Dispatcher, HandlerConfig, Level, Record, StopMode, Target,
};
use parking_lot::Mutex;

fn collector() -> (Destination, Arc<Mutex<Vec<String>>>) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let destination = Destination::callable(move |m| {
        sink.lock().push(m.text.to_string());
        Ok(())
    });
    (destination, lines)
}

fn record(level: Level, message: &str) -> Record {
    Record::builder(level, message).build().unwrap()
}

fn file_sizes(dir: &Path) -> Vec<u64> {
    let mut sizes: Vec<u64> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap())
        .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .map(|e| e.metadata().unwrap().len())
        .collect();
    sizes.sort();
    sizes
}

#[test]
fn info_handler_collects_only_info_record_once() {
    let dispatcher = Dispatcher::new();
    let formatted = Arc::new(AtomicUsize::new(0));
    let counter = formatted.clone();
    let (destination, lines) = collector();
    dispatcher
        .register(
            HandlerConfig::new(destination)
                .level(Level::Info)
                .format_fn(move |r| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    format!("{} {}\n", r.level, r.message)
                }),
        )
        .unwrap();

    dispatcher.dispatch(record(Level::Debug, "debug detail")).unwrap();
    dispatcher.dispatch(record(Level::Info, "service ready")).unwrap();

    assert_eq!(*lines.lock(), vec!["INFO service ready\n"]);
    assert_eq!(formatted.load(Ordering::SeqCst), 1);
}

#[test]
fn queued_handler_keeps_submission_order() {
    for k in [0usize, 1, 17, 500] {
        let dispatcher = Dispatcher::new();
        let (destination, lines) = collector();
        dispatcher
            .register(HandlerConfig::new(destination).format("{message}").enqueue(true))
            .unwrap();

        for i in 0..k {
            dispatcher.dispatch(record(Level::Info, &format!("m{i}"))).unwrap();
        }
        assert_eq!(dispatcher.complete(Target::All, None), Completion::Done);

        let expected: Vec<String> = (0..k).map(|i| format!("m{i}\n")).collect();
        assert_eq!(*lines.lock(), expected, "k = {k}");
    }
}

#[test]
fn complete_observes_every_record_from_many_threads() {
    let dispatcher = Arc::new(Dispatcher::new());
    let (destination, lines) = collector();
    dispatcher
        .register(HandlerConfig::new(destination).format("{message}").enqueue(true))
        .unwrap();

    let producers: Vec<_> = (0..4)
        .map(|t| {
            let dispatcher = dispatcher.clone();
            thread::spawn(move || {
                for i in 0..250 {
                    dispatcher
                        .dispatch(record(Level::Info, &format!("t{t}-{i}")))
                        .unwrap();
                }
            })
        })
        .collect();
    for p in producers {
        p.join().unwrap();
    }

    assert_eq!(
        dispatcher.complete(Target::All, Some(Duration::from_secs(10))),
        Completion::Done
    );
    let mut seen = lines.lock().clone();
    assert_eq!(seen.len(), 1000);
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 1000);
}

#[test]
fn caught_failure_does_not_disturb_other_handlers() {
    let dispatcher = Dispatcher::new();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let reported = errors.clone();
    let broken = dispatcher
        .register(
            HandlerConfig::new(Destination::callable(|_| Err("sink is down".into())))
                .on_error(move |e| reported.lock().push(e.handler_id)),
        )
        .unwrap();
    let (destination, lines) = collector();
    dispatcher
        .register(HandlerConfig::new(destination).format("{message}"))
        .unwrap();

    for i in 0..3 {
        assert!(dispatcher.dispatch(record(Level::Error, &format!("e{i}"))).is_ok());
    }

    assert_eq!(*lines.lock(), vec!["e0\n", "e1\n", "e2\n"]);
    assert_eq!(*errors.lock(), vec![broken; 3]);
    assert_eq!(dispatcher.metrics(broken).unwrap().failure_count, 3);
}

#[test]
fn uncaught_sync_failure_propagates_after_all_handlers_ran() {
    let dispatcher = Dispatcher::new();
    let broken = dispatcher
        .register(HandlerConfig::new(Destination::callable(|_| Err("boom".into()))).catch(false))
        .unwrap();
    let (destination, lines) = collector();
    dispatcher
        .register(HandlerConfig::new(destination).format("{message}"))
        .unwrap();

    let err = dispatcher.dispatch(record(Level::Info, "x")).unwrap_err();
    assert_eq!(err.handler_id, broken);
    assert_eq!(*lines.lock(), vec!["x\n"]);
}

#[test]
fn format_errors_are_contained() {
    let dispatcher = Dispatcher::new();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let reported = errors.clone();
    let (destination, lines) = collector();
    dispatcher
        .register(
            HandlerConfig::new(destination)
                .format("{extra[user]} {message}")
                .on_error(move |e| reported.lock().push(e.to_string())),
        )
        .unwrap();

    dispatcher.dispatch(record(Level::Info, "anonymous")).unwrap();
    dispatcher
        .dispatch(
            Record::builder(Level::Info, "hello {user}")
                .named("user", "bob")
                .build()
                .unwrap(),
        )
        .unwrap();

    assert_eq!(*lines.lock(), vec!["bob hello bob\n"]);
    assert_eq!(errors.lock().len(), 1);
}

#[test]
fn size_rotation_splits_sixty_and_sixty() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new();
    let id = dispatcher
        .register(
            HandlerConfig::new(dir.path().join("app.log"))
                .format("{message}")
                .rotation(100u64),
        )
        .unwrap();

    // 59 characters plus the newline.
    let line = "x".repeat(59);
    dispatcher.dispatch(record(Level::Info, &line)).unwrap();
    dispatcher.dispatch(record(Level::Info, &line)).unwrap();
    assert_eq!(dispatcher.metrics(id).unwrap().rotation_count, 1);
    dispatcher.remove(id);

    assert_eq!(file_sizes(dir.path()), vec![60, 60]);
}

#[test]
fn retention_keeps_newest_rotated_files() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new();
    let id = dispatcher
        .register(
            HandlerConfig::new(dir.path().join("app.log"))
                .format("{message}")
                .rotation("10 B")
                .retention("2"),
        )
        .unwrap();

    for i in 0..7 {
        dispatcher
            .dispatch(record(Level::Info, &format!("line {i:04}")))
            .unwrap();
    }
    assert_eq!(dispatcher.metrics(id).unwrap().rotation_count, 6);
    dispatcher.remove(id);

    // Two rotated files survive next to the active one.
    assert_eq!(file_sizes(dir.path()).len(), 3);
    assert_eq!(
        fs::read_to_string(dir.path().join("app.log")).unwrap(),
        "line 0006\n"
    );
}

#[test]
fn missing_directory_fails_registration() {
    let dir = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new();
    let result = dispatcher.register(HandlerConfig::new(dir.path().join("nope").join("app.log")));
    assert!(matches!(
        result,
        Err(log_pipeline::ConfigurationError::Unwritable { .. })
    ));
    assert!(dispatcher.handlers().is_empty());
}

#[test]
fn removal_during_dispatch_never_writes_after_close() {
    let dispatcher = Arc::new(Dispatcher::new());
    let closed = Arc::new(Mutex::new(false));
    let late_writes = Arc::new(AtomicUsize::new(0));

    let flag = closed.clone();
    let late = late_writes.clone();
    let id = dispatcher
        .register(HandlerConfig::new(Destination::callable(move |_| {
            if *flag.lock() {
                late.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })))
        .unwrap();

    let producer = {
        let dispatcher = dispatcher.clone();
        thread::spawn(move || {
            for i in 0..2000 {
                dispatcher.dispatch(record(Level::Info, &format!("r{i}"))).unwrap();
            }
        })
    };
    thread::sleep(Duration::from_millis(5));
    assert!(dispatcher.remove_with(id, StopMode::Graceful));
    *closed.lock() = true;
    producer.join().unwrap();

    assert_eq!(late_writes.load(Ordering::SeqCst), 0);
    assert!(dispatcher.handlers().is_empty());
}

#[test]
fn markup_in_record_messages_renders_and_strips() {
    let dispatcher = Dispatcher::new();
    let (colored, colored_lines) = collector();
    let (plain, plain_lines) = collector();
    dispatcher
        .register(HandlerConfig::new(colored).format("{message}").colorize(true))
        .unwrap();
    dispatcher
        .register(HandlerConfig::new(plain).format("{message}").colorize(false))
        .unwrap();

    dispatcher
        .dispatch(
            Record::builder(Level::Info, "<red>alert</red> for {}")
                .arg("<b>user</b>")
                .markup(true)
                .build()
                .unwrap(),
        )
        .unwrap();

    let colored = colored_lines.lock()[0].clone();
    assert!(colored.contains("\x1b[31m"));
    assert_eq!(strip_ansi(&colored), "alert for <b>user</b>\n");
    assert_eq!(*plain_lines.lock(), vec!["alert for <b>user</b>\n"]);
}

#[test]
fn serialized_lines_are_json() {
    let dispatcher = Dispatcher::new();
    let (destination, lines) = collector();
    dispatcher
        .register(HandlerConfig::new(destination).format("{message}").serialize(true))
        .unwrap();
    dispatcher
        .dispatch(
            Record::builder(Level::Warning, "disk at {pct}%")
                .named("pct", 91)
                .build()
                .unwrap(),
        )
        .unwrap();

    let line = lines.lock()[0].clone();
    assert!(line.ends_with('\n'));
    let value: serde_json::Value = serde_json::from_str(line.trim_end()).unwrap();
    assert_eq!(value["text"], "disk at 91%\n");
    assert_eq!(value["record"]["level"], "WARNING");
    assert_eq!(value["record"]["extra"]["pct"], 91);
}
