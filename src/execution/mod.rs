pub mod executor;
pub mod monitor;

pub use executor::{
    realized_profit_pct, round_trip_fee_pct, round_trip_fee_rate, CloseReceipt, ExecutionReceipt,
    LifecycleError, TradeExecutor,
};
pub use monitor::{CloseCause, MonitorEvent, PositionMonitor};
