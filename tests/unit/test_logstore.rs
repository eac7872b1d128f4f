//! Task log store layout and concurrency tests.

use std::sync::Arc;

use cicd_agent::tasks::logstore::TaskLogStore;

#[test]
fn test_log_layout_matches_task_and_step() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskLogStore::new_in(dir.path(), "svc-a-1.2.3-1700000000");
    store.write_step("deployService", "INFO", "applying manifests");
    store.write_console("INFO", "task started");

    let task_dir = dir.path().join("svc-a-1.2.3-1700000000");
    assert!(task_dir.join("deployService.log").exists());
    assert!(task_dir.join("console.log").exists());
}

#[test]
fn test_concurrent_writers_preserve_line_integrity() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(TaskLogStore::new_in(dir.path(), "task-1"));

    let mut handles = Vec::new();
    for worker in 0..8 {
        let store = store.clone();
        handles.push(std::thread::spawn(move || {
            for i in 0..50 {
                store.write_step("pullOnline", "INFO", &format!("worker-{} line-{}", worker, i));
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let contents =
        std::fs::read_to_string(dir.path().join("task-1").join("pullOnline.log")).unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 8 * 50);
    for line in lines {
        assert!(line.contains("[INFO] worker-"), "corrupt line: {}", line);
    }
}

#[test]
fn test_command_output_written_as_raw_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let store = TaskLogStore::new_in(dir.path(), "task-2");

    // subprocess output is bytes, not necessarily valid UTF-8
    let output = [b"progress: 50%\xff\xfe partial\n".as_ref()].concat();
    store.write_command("pushLocal", "docker push img", &output, None);

    let raw = std::fs::read(dir.path().join("task-2").join("pushLocal.log")).unwrap();
    let needle = b"\xff\xfe";
    assert!(raw.windows(2).any(|w| w == needle));
}

#[test]
fn test_step_writer_streams_into_same_file() {
    use std::io::Write;

    let dir = tempfile::tempdir().unwrap();
    let store = TaskLogStore::new_in(dir.path(), "task-3");
    store.write_step("checkService", "INFO", "before stream");

    let mut writer = store.step_writer("checkService").unwrap();
    writer.write_all(b"streamed subprocess output\n").unwrap();
    writer.flush().unwrap();

    let contents =
        std::fs::read_to_string(dir.path().join("task-3").join("checkService.log")).unwrap();
    assert!(contents.contains("before stream"));
    assert!(contents.contains("streamed subprocess output"));
}
