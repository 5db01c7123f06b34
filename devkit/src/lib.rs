/*!
# Kiosk DevKit - Harness et kiosque simulé pour tests

Bibliothèque facilitant les tests bout-en-bout du kernel avec:
- Base SQLite en mémoire pré-remplie (institutions, kiosques)
- Client HTTP in-process sur le vrai routeur (sans socket)
- Kiosque simulé qui heartbeat, claim et report via l'API device
*/

pub mod device_sim;
pub mod fixtures;

pub use device_sim::{Exchange, SimulatedKiosk};
pub use fixtures::TestHarness;
