//! Logging hooks. `anchordb` logs through the `log` facade at points that
//! matter operationally — WAL sync failures, recovery corruption and
//! progress, checkpoint publish, vacuum progress (see `wal::writer`,
//! `recovery`, `checkpoint`, `vacuum`) — but, being an embeddable library
//! rather than a CLI or server, never installs a subscriber itself; that
//! policy decision belongs to the embedding application.
//!
//! `init_for_tests` is the one exception: a helper so integration tests can
//! see `log::` output on failure without every test file hand rolling a
//! `log4rs` config. It lives behind the `testing` feature rather than
//! `#[cfg(test)]`: the crate's own unit tests compile with `--cfg test`,
//! but `tests/*.rs` integration tests link the library as an ordinary
//! dependency and never see that cfg, so a `#[cfg(test)]`-gated function
//! would be invisible to them. `cargo test --features testing` enables it
//! for both.

#[cfg(feature = "testing")]
static INIT: std::sync::Once = std::sync::Once::new();

/// Initializes a simple stderr logger for test binaries. Safe to call from
/// every test; only the first call takes effect.
#[cfg(feature = "testing")]
pub fn init_for_tests() {
    use log::LevelFilter;
    use log4rs::append::console::ConsoleAppender;
    use log4rs::config::{Appender, Config, Root};
    use log4rs::encode::pattern::PatternEncoder;

    INIT.call_once(|| {
        let encoder = Box::new(PatternEncoder::new("{d(%H:%M:%S%.3f)} [{l}] {t} - {m}{n}"));
        let appender = ConsoleAppender::builder().encoder(encoder).build();
        if let Ok(config) = Config::builder()
            .appender(Appender::builder().build("stderr", Box::new(appender)))
            .build(Root::builder().appender("stderr").build(LevelFilter::Debug))
        {
            let _ = log4rs::init_config(config);
        }
    });
}
