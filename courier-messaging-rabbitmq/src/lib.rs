mod options;
mod rabbit_broker;
mod signal;

pub use options::RabbitOptions;
pub use rabbit_broker::{RabbitBroker, RabbitChannel, RabbitConnection};
pub use signal::shutdown_signal;

use courier_messaging_core::{MessagingError, Messenger, Options, Settings};

/// Builds a [`Messenger`] over RabbitMQ, waits for the first connection and
/// arranges for it to be closed on Ctrl-C / SIGTERM.
///
/// Dial failures are retried on the backoff sequence in `options`, so this
/// only returns an error once the messenger has been closed.
pub async fn connect(
    settings: Settings,
    options: Options,
    rabbit: RabbitOptions,
) -> Result<Messenger<RabbitBroker>, MessagingError> {
    let messenger = Messenger::new(RabbitBroker::new(rabbit), settings, options);
    messenger.manager().connection().await?;
    messenger.manager().close_on(shutdown_signal());
    Ok(messenger)
}
