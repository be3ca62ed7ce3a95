//! Driver Registry
//!
//! Central registry for all available protocol adapters.

use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::traits::DataEngine;
use crate::engine::types::Protocol;

/// Registry that holds one adapter per protocol
pub struct DriverRegistry {
    drivers: HashMap<Protocol, Arc<dyn DataEngine>>,
}

impl DriverRegistry {
    /// Creates a new empty registry
    pub fn new() -> Self {
        Self {
            drivers: HashMap::new(),
        }
    }

    /// Creates a registry holding the five built-in adapters
    pub fn with_builtin_drivers() -> Self {
        use crate::engine::drivers::{
            mongodb::MongoDriver, mysql::MySqlDriver, postgres::PostgresDriver,
            redis::RedisDriver, sqlite::SqliteDriver,
        };

        let mut registry = Self::new();
        registry.register(Arc::new(MySqlDriver::new()));
        registry.register(Arc::new(PostgresDriver::new()));
        registry.register(Arc::new(MongoDriver::new()));
        registry.register(Arc::new(RedisDriver::new()));
        registry.register(Arc::new(SqliteDriver::new()));
        registry
    }

    /// Registers a new driver
    ///
    /// The driver's `protocol()` is used as the key.
    pub fn register(&mut self, driver: Arc<dyn DataEngine>) {
        self.drivers.insert(driver.protocol(), driver);
    }

    /// Gets a driver by its protocol
    pub fn get(&self, protocol: Protocol) -> Option<Arc<dyn DataEngine>> {
        self.drivers.get(&protocol).cloned()
    }

}
