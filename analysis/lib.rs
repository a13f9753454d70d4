#![deny(dead_code)]
#![deny(unused_imports)]
#![allow(non_snake_case)]

//! Bayesian bright/dark spot analysis for national catch nutritional quality.
//!
//! The library is laid out leaf-first: `data` and `design` turn the source table
//! into a design matrix with explicit missing cells, `imputation` and
//! `likelihood` hold the two halves of the joint model, `model` wires them into a
//! single log density over an unconstrained parameter vector, `hmc` samples it,
//! and `summary`/`scoring` turn draws into the two output tables. `plots` and
//! `report` describe and write the outputs, `pipeline` runs the stages in
//! order, and `synthetic` generates tables from a known model.

pub mod config;
pub mod data;
pub mod design;
pub mod diagnostics;
pub mod hmc;
pub mod imputation;
pub mod likelihood;
pub mod model;
pub mod pipeline;
pub mod plots;
pub mod report;
pub mod scoring;
pub mod summary;
pub mod synthetic;
