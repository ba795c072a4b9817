use std::sync::Arc;

/// Holds the Sentry client guard for the process lifetime. Reporting is a
/// no-op when `SENTRY_DSN` is not set.
#[derive(Clone)]
pub struct SentryService {
    guard: Option<Arc<sentry::ClientInitGuard>>,
}

impl SentryService {
    pub fn new() -> Self {
        let guard = match std::env::var("SENTRY_DSN") {
            Ok(dsn) if !dsn.is_empty() => {
                let guard = sentry::init((
                    dsn,
                    sentry::ClientOptions {
                        release: sentry::release_name!(),
                        ..Default::default()
                    },
                ));
                Some(Arc::new(guard))
            }
            _ => None,
        };
        Self { guard }
    }

    pub fn enabled(&self) -> bool {
        self.guard.is_some()
    }
}

impl Default for SentryService {
    fn default() -> Self {
        Self::new()
    }
}
