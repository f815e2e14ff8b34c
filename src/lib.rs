//! Payment orchestration for Myanmar mobile wallets (KBZPay, WavePay, AYAPay):
//! provider adapters, an append-only transaction ledger, webhook
//! verification, reconciliation and EMVCo merchant QR codes.

pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod database;
pub mod error;
pub mod health;
pub mod logging;
pub mod middleware;
pub mod payments;
pub mod qr;
pub mod services;
pub mod workers;
