//! Integration and differential tests for the dynx86 workspace.

#[cfg(test)]
mod backend;
#[cfg(test)]
mod decode;
#[cfg(all(test, target_arch = "x86_64"))]
mod exec;
#[cfg(all(test, target_arch = "x86_64"))]
mod frontend;
#[cfg(test)]
mod interp;

/// Route library logs to the test harness output.
#[cfg(test)]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .with_test_writer()
        .try_init();
}
