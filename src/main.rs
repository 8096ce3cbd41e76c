mod camera;
mod config_loader;
mod error;
mod frame_scheduler;
mod loader;
mod render;
mod scene;
mod utility;
mod vulkan;

use std::sync::Arc;

use anyhow::Context as _;
use ash::vk;
use camera::Camera;
use config_loader::{Config, ConfigFileLoader};
use error::Result;
use frame_scheduler::{FrameOutcome, FrameScheduler, SurfaceFrames};
use log::{debug, error, info};
use render::pass::{raster::RasterPass, ray_tracing::RayTracingPass};
use scene::{Mesh, Scene, Texture};
use vulkan::acceleration_structure::{AccelerationStructure, AccelerationStructureBuilder};
use vulkan::command_pool::CommandPool;
use vulkan::context::{Context, SurfaceIndex};
use vulkan::swapchain::SwapchainContainer;
use vulkan::window_settings::WindowSettings;
use winit::dpi;
use winit::event::{ElementState, Event, KeyboardInput, VirtualKeyCode, WindowEvent};
use winit::event_loop::EventLoop;
use winit::window::{Window, WindowBuilder, WindowId};

const CONFIG_PATH: &str = "config.json";

// Rust will drop these fields in the order they are declared
struct Mirage {
    raster: FrameScheduler<SurfaceFrames<RasterPass>>,
    ray_traced: FrameScheduler<SurfaceFrames<RayTracingPass>>,

    _top_level: Arc<AccelerationStructure>,
    _bottom_level: AccelerationStructure,
    _scene: Arc<Scene>,
    _command_pool: CommandPool,
    context: Arc<Context>,

    raster_window: Arc<Window>,
    ray_traced_window: Arc<Window>,
}

impl Mirage {
    pub fn new(event_loop: &EventLoop<()>, config: &Config) -> Result<Self> {
        let raster_window = Arc::new(create_window(event_loop, &config.raster_window)?);
        let ray_traced_window = Arc::new(create_window(event_loop, &config.ray_traced_window)?);

        let loaded_model = loader::load_model(&config.model_path)?;

        let context = Arc::new(Context::new(
            event_loop,
            &[&*raster_window, &*ray_traced_window],
        )?);

        let command_pool = CommandPool::new(context.clone())?;

        let mesh = Mesh::new(context.clone(), &loaded_model.mesh)?;
        let texture = Texture::new(context.clone(), &command_pool, &loaded_model.texture)?;
        let scene = Arc::new(Scene { mesh, texture });

        let builder = AccelerationStructureBuilder::new(context.clone(), command_pool.clone());
        let bottom_level = builder.build_bottom_level(&scene.mesh.triangle_geometry())?;
        let top_level = Arc::new(builder.build_top_level(&[&bottom_level])?);

        let present_mode = vk::PresentModeKHR::from(config.present_mode);

        let raster_swapchain = SwapchainContainer::new(
            context.clone(),
            SurfaceIndex(0),
            raster_window.inner_size(),
            present_mode,
            vk::ImageUsageFlags::COLOR_ATTACHMENT,
        )?;
        let raster_pass = RasterPass::new(
            context.clone(),
            &raster_swapchain,
            scene.clone(),
            Camera::new(config.raster_camera.clone()),
            &config.shader_directory,
        )?;
        let raster = FrameScheduler::new(SurfaceFrames::new(
            context.clone(),
            raster_window.clone(),
            raster_swapchain,
            raster_pass,
        )?);

        let ray_traced_swapchain = SwapchainContainer::new(
            context.clone(),
            SurfaceIndex(1),
            ray_traced_window.inner_size(),
            present_mode,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
        )?;
        let ray_tracing_pass = RayTracingPass::new(
            context.clone(),
            &command_pool,
            top_level.clone(),
            Camera::new(config.ray_traced_camera.clone()),
            config.ray_traced_window.extent(),
            &config.shader_directory,
        )?;
        let ray_traced = FrameScheduler::new(SurfaceFrames::new(
            context.clone(),
            ray_traced_window.clone(),
            ray_traced_swapchain,
            ray_tracing_pass,
        )?);

        info!("Renderer ready on {}", context.physical_device_name);

        Ok(Self {
            raster,
            ray_traced,
            _top_level: top_level,
            _bottom_level: bottom_level,
            _scene: scene,
            _command_pool: command_pool,
            context,
            raster_window,
            ray_traced_window,
        })
    }

    pub fn main_loop(mut self, event_loop: EventLoop<()>) -> ! {
        event_loop.run(move |event, _, control_flow| {
            control_flow.set_poll();

            match event {
                Event::WindowEvent { event, window_id } => match event {
                    WindowEvent::CloseRequested => {
                        control_flow.set_exit();
                    }
                    WindowEvent::Resized(size) => {
                        debug!("Window resized to {}x{}", size.width, size.height);
                        self.request_resize(window_id);
                    }
                    WindowEvent::KeyboardInput {
                        input:
                            KeyboardInput {
                                virtual_keycode: Some(VirtualKeyCode::Escape),
                                state: ElementState::Pressed,
                                ..
                            },
                        ..
                    } => {
                        control_flow.set_exit();
                    }
                    _ => {}
                },
                Event::MainEventsCleared => {
                    if let Err(e) = self.draw_frames() {
                        self.exit_with_error(e);
                    }
                }
                Event::LoopDestroyed => {
                    info!("Shutting down");
                    if let Err(e) = self.context.wait_idle() {
                        error!("{}", e);
                    }
                }
                _ => (),
            }
        })
    }

    fn request_resize(&mut self, window_id: WindowId) {
        if window_id == self.raster_window.id() {
            self.raster.request_resize();
        } else if window_id == self.ray_traced_window.id() {
            self.ray_traced.request_resize();
        }
    }

    fn draw_frames(&mut self) -> Result<()> {
        let raster = self.raster.draw_frame()?;
        let ray_traced = self.ray_traced.draw_frame()?;
        for (name, outcome) in [("raster", raster), ("ray traced", ray_traced)] {
            if outcome == FrameOutcome::Recreated {
                debug!("Recreated the {} swapchain", name);
            }
        }
        Ok(())
    }

    fn exit_with_error(&self, e: error::RendererError) -> ! {
        error!("{}", e);
        let _ = self.context.wait_idle();
        std::process::exit(1);
    }
}

impl Drop for Mirage {
    fn drop(&mut self) {
        if let Err(e) = self.context.wait_idle() {
            error!("{}", e);
        }
    }
}

fn create_window(event_loop: &EventLoop<()>, settings: &WindowSettings) -> Result<Window> {
    let window = WindowBuilder::new()
        .with_title(&settings.title)
        .with_inner_size(dpi::PhysicalSize {
            width: settings.width,
            height: settings.height,
        })
        .with_resizable(settings.resizable)
        .build(event_loop)?;
    Ok(window)
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config_loader = ConfigFileLoader::new(CONFIG_PATH);
    let config = config_loader
        .load_config()
        .with_context(|| format!("Could not load {}", CONFIG_PATH))?
        .clone();

    let event_loop = EventLoop::new();
    let mirage = Mirage::new(&event_loop, &config).context("Could not start the renderer")?;
    mirage.main_loop(event_loop)
}
