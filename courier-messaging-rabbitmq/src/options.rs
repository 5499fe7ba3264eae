use lapin::ConnectionProperties;

/// lapin-specific knobs that have no counterpart on other brokers.
#[derive(Clone, Debug, Default)]
pub struct RabbitOptions {
    /// Shown next to the connection in the management UI.
    pub connection_name: Option<String>,
    /// If true, channels run in confirm mode and a publish waits for the broker ACK/NACK.
    pub confirms: bool,
}

impl RabbitOptions {
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn with_confirms(mut self, confirms: bool) -> Self {
        self.confirms = confirms;
        self
    }

    pub(crate) fn connection_properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }
}
