#![allow(dead_code)]

use std::sync::Once;

use quarry::queue_store::{NewJob, QueueStore};
use quarry::semaphore::TenantSemaphore;

static BOOT: Once = Once::new();

/// Start the FDB client network once for the whole test process. The
/// guard is leaked deliberately: it must outlive every database handle,
/// and tests share the process.
pub fn boot_fdb() {
    BOOT.call_once(|| {
        let network = unsafe { foundationdb::boot() };
        std::mem::forget(network);
    });
}

pub fn open_store() -> QueueStore {
    boot_fdb();
    QueueStore::open(None).expect("open queue store")
}

pub fn open_semaphore(self_hosted: bool) -> TenantSemaphore {
    boot_fdb();
    TenantSemaphore::open(None, self_hosted).expect("open semaphore")
}

/// Unique id per test run so tests sharing a cluster never collide.
pub fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4().simple())
}

pub fn test_job(id: &str, priority: i32) -> NewJob {
    NewJob {
        id: id.to_string(),
        data: format!("payload-{id}").into_bytes(),
        priority,
        listenable: false,
        listen_channel_id: None,
    }
}
