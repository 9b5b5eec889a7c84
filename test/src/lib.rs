pub mod block;

/// Assert that an expression matches a pattern.
#[macro_export]
macro_rules! assert_matches {
    ($left:expr, $pattern:pat $(if $guard:expr)? $(,)?) => {
        match $left {
            $pattern $(if $guard)? => {}
            ref left => panic!(
                "assertion failed: `{:?}` does not match `{}`",
                left,
                stringify!($pattern $(if $guard)?)
            ),
        }
    };
}

pub mod logger {
    use log::*;

    struct Logger {
        level: Level,
    }

    impl Log for Logger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= self.level
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                println!("test> [{}] {}", record.target(), record.args())
            }
        }

        fn flush(&self) {}
    }

    /// Install the test logger. Calling this more than once is harmless.
    pub fn init(level: Level) {
        let logger = Logger { level };

        log::set_boxed_logger(Box::new(logger)).ok();
        log::set_max_level(level.to_level_filter());
    }
}
