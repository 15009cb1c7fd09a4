pub mod bt_discovery;
pub mod gatt;
pub mod rfcomm;
pub mod tcp;
pub mod traits;

pub use bt_discovery::{BtDiscovery, BtDiscoveryConfig};
pub use gatt::{BluerGattClient, GattConfig};
pub use rfcomm::RfcommConnector;
pub use tcp::{TcpConnector, UnavailableGatt};
pub use traits::{
    connection_strategies, DiscoveredService, GattClient, GattEvent, GattLink, StreamConnector,
    TransportStream,
};
