//! Pay-per-request HTTP API gateway speaking the x402 payment protocol.
//!
//! The gateway fronts arbitrary upstream REST APIs and admits each request
//! only with a verifiable USDC micropayment, following the HTTP 402
//! challenge/response exchange. An optional signed spending mandate caps
//! what an agent may spend per UTC day and on which tools. Admitted
//! requests are proxied upstream with strict header hygiene and every
//! request, however it terminates, leaves exactly one structured receipt.
//!
//! # Pipeline
//!
//! Inbound HTTP → admission predicates → route match → replay check →
//! mandate check → payment verify → upstream proxy → payment settle →
//! receipt emit. Each stage can abort the request with a typed denial; see
//! [`pipeline`] for the full stage table.
//!
//! # Modules
//!
//! - [`admission`] — SSRF guard, x402-upstream probe, agent blocklist, API-key check.
//! - [`anchor`] — optional serialized on-chain intent writer.
//! - [`config`] — environment ingestion and the persisted config document.
//! - [`facilitator`] — HTTP client for the remote verify/settle facilitator.
//! - [`mandate`] — AP2 mandate decoding and EIP-191 verification.
//! - [`network`] — known networks and CAIP-2 identifiers.
//! - [`payment`] — x402 price quoting and verify/settle orchestration.
//! - [`pipeline`] — the request-admission state machine.
//! - [`proxy`] — upstream forwarding with header hygiene.
//! - [`receipt`] — receipt types and the in-memory receipt log.
//! - [`replay`] — idempotency-fingerprint replay suppression.
//! - [`route_table`] — route compilation, matching, and copy-on-write mutation.
//! - [`spend`] — per-mandate daily and lifetime spend counters.

pub mod admission;
pub mod anchor;
pub mod config;
pub mod facilitator;
pub mod handlers;
pub mod mandate;
pub mod network;
pub mod payment;
pub mod pipeline;
pub mod proxy;
pub mod receipt;
pub mod replay;
pub mod route_table;
pub mod routes_store;
pub mod spend;
pub mod telemetry;
pub mod usd;
pub mod util;
