use clap::Parser;

/// TCP-fronted bridge that forwards sound-file upload sessions onto a
/// USB-attached Harp sound card.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// Listen address
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Listen port
    #[arg(long, default_value_t = 9999)]
    pub port: u16,

    /// Harp sound card USB vendor ID
    #[arg(long, default_value_t = 0x04d8)]
    pub usb_vendor_id: u16,

    /// Harp sound card USB product ID
    #[arg(long, default_value_t = 0xee6a)]
    pub usb_product_id: u16,

    /// USB configuration value to select on the device
    #[arg(long, default_value_t = 1)]
    pub usb_config_value: u8,

    /// Timeout for the USB reply to a HEADER command, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub header_timeout_ms: u64,

    /// Timeout for the USB reply to a DATA command, in milliseconds
    #[arg(long, default_value_t = 400)]
    pub data_timeout_ms: u64,

    /// Settle time after a device reset before reopening, in milliseconds
    #[arg(long, default_value_t = 700)]
    pub reset_settle_ms: u64,

    /// Backoff between USB reconnect attempts, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub reconnect_backoff_ms: u64,

    /// Stats logging interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 5)]
    pub stats_interval_secs: u64,
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn header_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.header_timeout_ms)
    }

    pub fn data_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.data_timeout_ms)
    }

    pub fn reset_settle(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reset_settle_ms)
    }

    pub fn reconnect_backoff(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reconnect_backoff_ms)
    }
}
