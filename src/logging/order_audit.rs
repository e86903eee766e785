use crate::model::{OrderIntent, TrackedOrder};
use anyhow::{Context, Result};
use chrono::Local;
use csv::Writer;
use rust_decimal::Decimal;
use serde::Serialize;
use std::fs::{create_dir_all, OpenOptions};
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Debug, Serialize, Clone)]
pub struct OrderRecord {
    pub timestamp: String,
    pub symbol: String,
    pub record_type: String, // REQ, FILL, CANCEL, REJECT
    pub level: i64,
    pub side: String,
    pub price: Decimal,
    pub size: Decimal,
    pub cloid: Option<String>,
    pub order_id: Option<String>,
    pub notes: Option<String>,
}

#[derive(Clone)]
pub struct OrderAuditLogger {
    writer: Arc<Mutex<Writer<std::fs::File>>>,
}

impl OrderAuditLogger {
    pub fn new(log_dir: &str) -> Result<Self> {
        let dir = Path::new(log_dir);
        create_dir_all(dir).context("Failed to create log directory")?;

        let file_path = dir.join("trades.csv");
        let file_exists = file_path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)
            .context("Failed to open trades.csv")?;

        let writer = csv::WriterBuilder::new()
            .has_headers(!file_exists)
            .from_writer(file);

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
        })
    }

    pub fn log(&self, record: OrderRecord) {
        if let Ok(mut w) = self.writer.lock() {
            if let Err(e) = w.serialize(record) {
                tracing::error!("Failed to write order audit log: {}", e);
            } else {
                let _ = w.flush();
            }
        }
    }

    fn record(
        symbol: &str,
        record_type: &str,
        intent: &OrderIntent,
        size: Decimal,
        order_id: Option<String>,
        notes: Option<String>,
    ) -> OrderRecord {
        OrderRecord {
            timestamp: Local::now().to_rfc3339(),
            symbol: symbol.to_string(),
            record_type: record_type.to_string(),
            level: intent.level,
            side: intent.side.to_string(),
            price: intent.price,
            size,
            cloid: Some(intent.cloid.to_string()),
            order_id,
            notes,
        }
    }

    pub fn log_req(&self, symbol: &str, intent: &OrderIntent, order_id: &str) {
        self.log(Self::record(
            symbol,
            "REQ",
            intent,
            intent.quantity,
            Some(order_id.to_string()),
            None,
        ));
    }

    /// `quantity` is the settled fill size, which may differ from what the
    /// order itself reported.
    pub fn log_fill(&self, symbol: &str, order: &TrackedOrder, quantity: Decimal) {
        self.log(Self::record(
            symbol,
            "FILL",
            &order.intent,
            quantity,
            Some(order.order_id.to_string()),
            None,
        ));
    }

    pub fn log_cancel(&self, symbol: &str, order: &TrackedOrder, reason: &str) {
        self.log(Self::record(
            symbol,
            "CANCEL",
            &order.intent,
            order.intent.quantity,
            Some(order.order_id.to_string()),
            Some(reason.to_string()),
        ));
    }

    pub fn log_reject(&self, symbol: &str, intent: &OrderIntent, reason: &str) {
        self.log(Self::record(
            symbol,
            "REJECT",
            intent,
            intent.quantity,
            None,
            Some(reason.to_string()),
        ));
    }
}
