//! Stub diagnostics: the `MOLTD_LOG_STUBS` environment variable and the
//! generated-stub registry.

use parking_lot::Mutex;
use std::{env, fs::File, io::Write, sync::LazyLock};

/// Log the disassembly of every generated stub. Set to `-` for stderr, or to
/// a path to append to a file.
static LOG_STUBS: LazyLock<Option<String>> =
    LazyLock::new(|| env::var("MOLTD_LOG_STUBS").ok());

/// Whether `MOLTD_LOG_STUBS` asked for stub dumps. Callers check this before
/// paying for disassembly.
pub(crate) fn stub_log_enabled() -> bool {
    LOG_STUBS.is_some()
}

pub(crate) fn log_stub(name: &str, body: &str) {
    match LOG_STUBS.as_deref() {
        Some("-") => eprintln!("--- Begin {name} ---\n{body}\n--- End {name} ---\n"),
        Some(path) => {
            File::options()
                .append(true)
                .create(true)
                .open(path)
                .map(|mut f| {
                    f.write_all(
                        format!("--- Begin {name} ---\n{body}\n--- End {name} ---\n\n").as_bytes(),
                    )
                })
                .ok();
        }
        None => (),
    }
}

/// One generated stub, as recorded for crash reporting and debugger support.
#[derive(Clone, Debug)]
pub struct StubInfo {
    pub name: String,
    pub entry: usize,
    pub size: usize,
}

static STUB_REGISTRY: Mutex<Vec<StubInfo>> = Mutex::new(Vec::new());

pub(crate) fn register_stub(name: String, entry: usize, size: usize) {
    STUB_REGISTRY.lock().push(StubInfo { name, entry, size });
}

/// Find the registered stub whose code range covers `addr`.
pub fn find_stub(addr: usize) -> Option<StubInfo> {
    STUB_REGISTRY
        .lock()
        .iter()
        .find(|s| addr >= s.entry && addr < s.entry + s.size)
        .cloned()
}
