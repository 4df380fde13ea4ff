//! `SQLite` database for the Tether relay server.

tether_core::define_database!(RelayDatabase, "Relay database migrations complete");
