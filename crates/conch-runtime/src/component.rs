//! Component protocol and the service handles injected into components.

use std::sync::Arc;

use async_trait::async_trait;

use conch_core::layout::{LayoutManager, Region};

use crate::controller::TerminalController;
use crate::error::Result;
use crate::events::EventBus;
use crate::state::StateManager;

/// Non-owning handles to the runtime services, injected at `init`.
///
/// Components borrow these; the runtime owns them. Holding the bundle
/// keeps the services alive but confers no lifecycle authority.
#[derive(Clone)]
pub struct Dependencies {
    /// Terminal controller (render queue, modes, immediate surface).
    pub controller: Arc<TerminalController>,
    /// Named regions and redraw batching.
    pub layout: Arc<LayoutManager>,
    /// Shared key/value state.
    pub state: Arc<StateManager>,
    /// Pub/sub bus.
    pub events: Arc<EventBus>,
}

/// Per-component context passed at `init`.
#[derive(Clone, Debug)]
pub struct ComponentContext {
    /// The id the component was registered under.
    pub id: String,
}

/// Capability set every hosted component implements.
///
/// Lifecycle: `init` (with dependencies) → `start` → input/render
/// cycles → `stop` → `cleanup`. Render and input handling are
/// synchronous; lifecycle transitions may await.
#[async_trait]
pub trait Component: Send {
    /// Stable unique id.
    fn id(&self) -> &str;

    /// Component kind label, e.g. `"footer"`.
    fn kind(&self) -> &str;

    /// Receive context and service handles. Called exactly once,
    /// before `start`.
    async fn init(&mut self, ctx: ComponentContext, deps: Dependencies) -> Result<()>;

    /// Begin operation (subscribe, define regions, spawn tasks).
    async fn start(&mut self) -> Result<()>;

    /// Cease operation; the component may be started again.
    async fn stop(&mut self) -> Result<()>;

    /// Release resources. Called once, after the final `stop`.
    async fn cleanup(&mut self) -> Result<()>;

    /// Paint into the component's region via the controller.
    fn render(&mut self) -> Result<()>;

    /// Whether the next runtime cycle should call `render`.
    fn needs_redraw(&self) -> bool;

    /// Offer input bytes; return `true` when consumed.
    fn handle_input(&mut self, input: &[u8]) -> Result<bool>;

    /// Whether the component currently accepts input offers.
    fn can_handle_input(&self) -> bool {
        false
    }

    /// The component's assigned region, if any.
    fn get_region(&self) -> Option<Region>;

    /// Assign the component's region.
    fn set_region(&mut self, region: Region);
}
