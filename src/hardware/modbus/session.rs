use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;
use tracing::trace;

use crate::domain::{BatteryError, UnitId};

/// One Modbus TCP connection, opened for a single device call.
///
/// Every operation is bounded by the session timeout. The socket closes when
/// the session is dropped.
pub struct ModbusSession {
    ctx: Context,
    unit: UnitId,
    limit: Duration,
}

impl ModbusSession {
    pub async fn open(addr: SocketAddr, unit: UnitId, limit: Duration) -> Result<Self, BatteryError> {
        let ctx = bounded(limit, tcp::connect_slave(addr, Slave(unit))).await?;
        trace!(%addr, unit, "modbus session opened");
        Ok(Self { ctx, unit, limit })
    }

    pub async fn read_holding(&mut self, register: u16) -> Result<u16, BatteryError> {
        let words = bounded(self.limit, self.ctx.read_holding_registers(register, 1)).await?;
        trace!(unit = self.unit, register, ?words, "read holding register");
        words.first().copied().ok_or_else(|| {
            BatteryError::Communication(format!("empty response for register {register}"))
        })
    }

    pub async fn write(&mut self, register: u16, value: u16) -> Result<(), BatteryError> {
        bounded(self.limit, self.ctx.write_single_register(register, value)).await?;
        trace!(unit = self.unit, register, value, "wrote holding register");
        Ok(())
    }
}

async fn bounded<T>(
    limit: Duration,
    op: impl Future<Output = std::io::Result<T>>,
) -> Result<T, BatteryError> {
    match timeout(limit, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(BatteryError::Communication(e.to_string())),
        Err(_) => Err(BatteryError::Timeout(limit.as_millis() as u64)),
    }
}
