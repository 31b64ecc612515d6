//! otter-worklets - worklet coordination core for Otter.
//!
//! This crate glues a platform UI thread, a dedicated worklet runtime and
//! native event sources together. It does not embed a script engine; the
//! engine plugs in through [`ScriptRuntime`] and [`Closure`].
//!
//! # Features
//!
//! - **Mappers**: a small dataflow engine re-running dirty mappers every frame
//! - **Event handlers**: native events dispatched to subscribed worklets
//! - **Value store**: script values kept alive across threads by owner handle
//! - **Schedulers**: UI/JS thread hopping without owning any threads
//!
//! # Example
//!
//! ```
//! use otter_worklets::prelude::*;
//! use serde_json::{Value, json};
//! use std::sync::Arc;
//!
//! let scheduler = Arc::new(QueueScheduler::new());
//! let module = WorkletModule::new(
//!     WorkletConfig::default(),
//!     &scheduler,
//!     Arc::new(TracingErrorHandler),
//! );
//! let ui = module.create_runtime(RuntimeKind::Ui);
//!
//! let scroll = module.make_mutable(json!(0));
//! let handler = Closure::new(ui.id(), move |rt, args| {
//!     rt.cells().set(scroll, args[0]["y"].clone())?;
//!     Ok(Value::Null)
//! });
//! module.register_event_handler("onScroll", handler).unwrap();
//! scheduler.trigger_ui();
//!
//! module.on_event(&ui, 16.0, "onScroll", &json!({"y": 42}));
//! assert_eq!(module.mutable_value(scroll), Some(json!(42)));
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkletModule                           │
//! │  HandleAllocator · CellSlab · frame callbacks                │
//! │  ┌───────────────┐ ┌──────────────────────┐ ┌────────────┐  │
//! │  │MapperRegistry │ │ EventHandlerRegistry │ │ ValueStore │  │
//! │  │  (Mutex)      │ │  (Mutex, 2 indexes)  │ │  (Mutex)   │  │
//! │  └───────────────┘ └──────────────────────┘ └────────────┘  │
//! └─────────────────────────────────────────────────────────────┘
//!            │ Weak                         │ Arc
//!            ↓                              ↓
//!   ┌─────────────────┐            ┌─────────────────┐
//!   │   Scheduler     │            │  ErrorHandler   │
//!   │ (UI / JS posts) │            │ (report_error)  │
//!   └─────────────────┘            └─────────────────┘
//! ```

pub mod cell;
pub mod closure;
pub mod config;
pub mod error;
pub mod error_handler;
pub mod event;
pub mod handle;
pub mod mapper;
pub mod module;
pub mod runtime;
pub mod scheduler;
pub mod store;

pub use cell::{CellSlab, MutableCell};
pub use closure::Closure;
pub use config::WorkletConfig;
pub use error::{ScriptError, WorkletError, WorkletResult};
pub use error_handler::{
    CapturingErrorHandler, ErrorHandler, ErrorInfo, ErrorSource, TracingErrorHandler,
};
pub use event::{EventHandlerRegistry, WorkletEventHandler};
pub use handle::{Handle, HandleAllocator};
pub use mapper::{Mapper, MapperRegistry, TickReport};
pub use module::{RenderRequester, WorkletModule};
pub use runtime::{RuntimeId, RuntimeKind, ScriptRuntime, WorkletRuntime};
pub use scheduler::{InlineScheduler, Job, QueueScheduler, Scheduler, WakeHook};
pub use store::{StoredRef, ValueStore};

pub mod prelude {
    pub use crate::cell::CellSlab;
    pub use crate::closure::Closure;
    pub use crate::config::WorkletConfig;
    pub use crate::error::{ScriptError, WorkletError, WorkletResult};
    pub use crate::error_handler::{
        CapturingErrorHandler, ErrorHandler, ErrorInfo, ErrorSource, TracingErrorHandler,
    };
    pub use crate::event::{EventHandlerRegistry, WorkletEventHandler};
    pub use crate::handle::Handle;
    pub use crate::mapper::{MapperRegistry, TickReport};
    pub use crate::module::WorkletModule;
    pub use crate::runtime::{RuntimeId, RuntimeKind, ScriptRuntime, WorkletRuntime};
    pub use crate::scheduler::{InlineScheduler, QueueScheduler, Scheduler};
    pub use crate::store::{StoredRef, ValueStore};
}
