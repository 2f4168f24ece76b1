//! Tasks pinned to a worker tid run on that worker and nowhere else.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use filament::{os, IoManager, ScheduleTask};

#[test]
fn pinned_tasks_stay_on_their_worker() {
    let iom = IoManager::new(3, false, "pinned").unwrap();

    let tids = iom.scheduler().worker_tids();
    assert_eq!(tids.len(), 3);
    let target = tids[1];

    let seen: Arc<Mutex<Vec<libc::pid_t>>> = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..100 {
        let seen = seen.clone();
        iom.scheduler().submit(
            ScheduleTask::callback(move || {
                seen.lock().unwrap().push(os::thread_id());
            })
            .pinned_to(target),
        );
    }

    assert!(
        common::wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() == 100),
        "pinned tasks did not drain"
    );
    iom.stop();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 100);
    assert!(
        seen.iter().all(|&tid| tid == target),
        "task escaped to another worker"
    );
}
