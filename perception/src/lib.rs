//! Perception tracking and fusion for a sorting robot.
//!
//! Color frames are segmented into per-color masks, shapes are detected on each mask,
//! placed in 3D with the aligned depth map, tracked per (shape, color) class and finally
//! fused into an accept or reject decision before being published.

pub mod database;
pub mod decision;
pub mod detect;
mod error;
pub mod mat;
mod models;
pub mod pipeline;
pub mod position;
pub mod publish;
pub mod segment;
pub mod task;
pub mod tracker;
pub mod verify;

pub use {
    database::{ParamsStore, Preset},
    decision::{Decision, DecisionReason, decide},
    error::{Error, Result},
    mat::DepthMap,
    models::*,
    pipeline::{Frame, FrameReport, Pipeline},
    position::{CameraMount, DepthEstimate, Intrinsics},
    publish::{AcceptedObject, Publisher, encode_object_message, to_hex},
    strum::{IntoEnumIterator, ParseError},
    task::BoundedCall,
    tracker::{MultiObjectTracker, TrackSnapshot},
    verify::{AiBox, BufferedBox, VerifiedBoxes},
};
