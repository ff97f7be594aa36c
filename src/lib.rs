mod config;
pub mod entities;
pub mod net;
pub mod telemetry;
pub mod world;

use std::sync::Arc;

pub use config::{AppConfig, NetConfig};
pub use net::auth::{AuthOutcome, Authenticator, DeferredAuthenticator, StaticAuthenticator};
pub use net::opcodes::OpcodeTable;
pub use net::packet::{PacketReader, PacketWriter};
pub use net::registry::HandlerRegistry;
pub use net::selector::{GateServer, ServerControl, ServerExit};
pub use world::registry::WorldRegistry;

pub fn run(args: &[String]) -> Result<(), String> {
    loop {
        let config = AppConfig::from_args(args)?;
        telemetry::logging::init(&config.root)?;

        let table = config.net.opcode_table(&config.root)?;
        println!(
            "ashfall: serving protocol revision {} ({} inbound workers)",
            table.revision, config.net.worker_threads
        );
        let registry = Arc::new(HandlerRegistry::new(table));

        let accounts = match StaticAuthenticator::load(&config.root)? {
            Some(accounts) => accounts,
            None => {
                println!("ashfall: no accounts.yml found, starting with an empty account table");
                StaticAuthenticator::default()
            }
        };
        let auth: Arc<dyn Authenticator> = Arc::new(DeferredAuthenticator::spawn(accounts));
        let world = Arc::new(WorldRegistry::new());
        let control = Arc::new(ServerControl::new());

        let gate = GateServer::new(
            config.net.clone(),
            Some(config.root.clone()),
            registry,
            auth,
            Arc::clone(&world),
            Arc::clone(&control),
        );
        let exit = gate.bind()?.run()?;

        match exit {
            ServerExit::Shutdown => return Ok(()),
            ServerExit::Restart => {
                println!("ashfall: restart requested, relaunching");
            }
        }
    }
}
