use std::collections::HashMap;
use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::foundation::core::{Affine, Size};
use crate::foundation::error::{ExportError, ExportResult};
use crate::render::backend::{CompositeScene, Compositor, CompositorStats, FrameRGBA};
use crate::render::surface_pool::SurfacePool;

const QUAD_SHADER: &str = r#"
struct Quad {
  m0: vec4<f32>,
  m1: vec4<f32>,
  tex: vec4<f32>,
};

struct VsOut {
  @builtin(position) pos: vec4<f32>,
  @location(0) uv: vec2<f32>,
};

@group(0) @binding(0) var t_src: texture_2d<f32>;
@group(0) @binding(1) var s_src: sampler;
@group(0) @binding(2) var<uniform> quad: Quad;

@vertex
fn vs(@builtin(vertex_index) vi: u32) -> VsOut {
  var corners = array<vec2<f32>, 6>(
    vec2<f32>(0.0, 0.0),
    vec2<f32>(1.0, 0.0),
    vec2<f32>(0.0, 1.0),
    vec2<f32>(0.0, 1.0),
    vec2<f32>(1.0, 0.0),
    vec2<f32>(1.0, 1.0),
  );
  let uv = corners[vi];
  let px = uv * quad.tex.xy;
  let p = vec2<f32>(
    quad.m0.x * px.x + quad.m0.z * px.y + quad.m1.x,
    quad.m0.y * px.x + quad.m0.w * px.y + quad.m1.y,
  );
  var o: VsOut;
  o.pos = vec4<f32>(p.x / quad.m1.z * 2.0 - 1.0, 1.0 - p.y / quad.m1.w * 2.0, 0.0, 1.0);
  o.uv = uv;
  return o;
}

@fragment
fn fs(in: VsOut) -> @location(0) vec4<f32> {
  return textureSample(t_src, s_src, in.uv);
}
"#;

const GRADE_SHADER: &str = r#"
struct Grade {
  r: vec4<f32>,
  g: vec4<f32>,
  b: vec4<f32>,
};

@group(0) @binding(0) var t_in: texture_2d<f32>;
@group(0) @binding(1) var t_lut: texture_2d<f32>;
@group(0) @binding(2) var<uniform> grade: Grade;

@vertex
fn vs(@builtin(vertex_index) vi: u32) -> @builtin(position) vec4<f32> {
  var p = array<vec2<f32>, 3>(
    vec2<f32>(-1.0, -1.0),
    vec2<f32>( 3.0, -1.0),
    vec2<f32>(-1.0,  3.0),
  );
  return vec4<f32>(p[vi], 0.0, 1.0);
}

fn curve(v: f32) -> f32 {
  let i = i32(round(clamp(v, 0.0, 1.0) * 255.0));
  return textureLoad(t_lut, vec2<i32>(i, 0), 0).r;
}

@fragment
fn fs(@builtin(position) pos: vec4<f32>) -> @location(0) vec4<f32> {
  let c = textureLoad(t_in, vec2<i32>(pos.xy), 0);
  let rgb = vec4<f32>(c.rgb, 1.0);
  return vec4<f32>(curve(dot(grade.r, rgb)), curve(dot(grade.g, rgb)), curve(dot(grade.b, rgb)), c.a);
}
"#;

struct Target {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
}

struct QuadPipeline {
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
    sampler: wgpu::Sampler,
}

struct GradePipeline {
    pipeline: wgpu::RenderPipeline,
    layout: wgpu::BindGroupLayout,
}

struct GradePass {
    target: Target,
    bind_group: wgpu::BindGroup,
    _lut: Target,
    _params: wgpu::Buffer,
}

/// Per-job GPU state. Created once in `prepare`, reused for every frame.
struct GpuJob {
    scene: CompositeScene,
    source: Target,
    frame_bind_group: wgpu::BindGroup,
    _frame_params: wgpu::Buffer,
    overlay_bind_groups: Vec<wgpu::BindGroup>,
    _overlay_textures: Vec<Target>,
    _overlay_params: Vec<wgpu::Buffer>,
    target: Target,
    grade: Option<GradePass>,
    readback: wgpu::Buffer,
    readback_bytes_per_row: u32,
}

/// wgpu compositor: textured quads with straight-alpha blending into an `Rgba8Unorm` target,
/// an optional full-screen grading pass, then a synchronous readback.
pub struct GpuCompositor {
    device: wgpu::Device,
    queue: wgpu::Queue,
    quad: QuadPipeline,
    grade: GradePipeline,
    pool: Arc<SurfacePool>,
    job: Option<GpuJob>,
    frames: u64,
    allocations: u64,
}

impl GpuCompositor {
    /// Acquire an adapter and device and build both pipelines.
    pub fn new(pool: Arc<SurfacePool>) -> ExportResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| match e {
            wgpu::RequestAdapterError::NotFound { .. } => {
                ExportError::gpu_setup("no gpu adapter available")
            }
            other => ExportError::gpu_setup(format!("wgpu request_adapter failed: {other:?}")),
        })?;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("burnin_device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            experimental_features: wgpu::ExperimentalFeatures::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
        }))
        .map_err(|e| ExportError::gpu_setup(format!("wgpu request_device failed: {e:?}")))?;

        device.push_error_scope(wgpu::ErrorFilter::Validation);
        let quad = build_quad_pipeline(&device);
        let grade = build_grade_pipeline(&device);
        if let Some(err) = pollster::block_on(device.pop_error_scope()) {
            return Err(ExportError::gpu_setup(format!(
                "pipeline creation failed: {err}"
            )));
        }

        tracing::debug!(adapter = ?adapter.get_info().name, "gpu compositor ready");
        Ok(Self {
            device,
            queue,
            quad,
            grade,
            pool,
            job: None,
            frames: 0,
            allocations: 0,
        })
    }

    fn create_target(&mut self, label: &str, size: Size, usage: wgpu::TextureUsages) -> Target {
        self.create_texture(label, size, wgpu::TextureFormat::Rgba8Unorm, usage)
    }

    fn create_texture(
        &mut self,
        label: &str,
        size: Size,
        format: wgpu::TextureFormat,
        usage: wgpu::TextureUsages,
    ) -> Target {
        self.allocations += 1;
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        Target { texture, view }
    }

    fn upload(&self, target: &Target, size: Size, bytes_per_px: u32, data: &[u8]) {
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &target.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(size.width * bytes_per_px),
                rows_per_image: Some(size.height),
            },
            extent(size),
        );
    }

    fn quad_bind_group(
        &mut self,
        label: &str,
        view: &wgpu::TextureView,
        transform: Affine,
        tex: Size,
        render: Size,
    ) -> (wgpu::Buffer, wgpu::BindGroup) {
        self.allocations += 2;
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents: &quad_params(transform, tex, render),
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.quad.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::Sampler(&self.quad.sampler),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params.as_entire_binding(),
                },
            ],
        });
        (params, bind_group)
    }

    fn build_job(&mut self, scene: CompositeScene) -> ExportResult<GpuJob> {
        let src_size = scene.source_size();
        let render = scene.render_size();

        let source = self.create_target(
            "burnin_source",
            src_size,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        let (frame_params, frame_bind_group) = self.quad_bind_group(
            "burnin_frame_quad",
            &source.view,
            scene.draw_transform(),
            src_size,
            render,
        );

        // One texture per distinct bitmap; the same sticker placed twice shares it.
        let mut overlay_textures: Vec<Target> = Vec::new();
        let mut texture_by_image: HashMap<usize, usize> = HashMap::new();
        let mut overlay_bind_groups = Vec::with_capacity(scene.overlays().len());
        let mut overlay_params = Vec::with_capacity(scene.overlays().len());
        for overlay in scene.overlays() {
            let ti = match texture_by_image.get(&overlay.image_id()) {
                Some(&i) => i,
                None => {
                    let t = self.create_target(
                        "burnin_overlay",
                        overlay.size(),
                        wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                    );
                    self.upload(&t, overlay.size(), 4, overlay.image().as_raw());
                    overlay_textures.push(t);
                    texture_by_image.insert(overlay.image_id(), overlay_textures.len() - 1);
                    overlay_textures.len() - 1
                }
            };
            let view = overlay_textures[ti].view.clone();
            let (params, bg) = self.quad_bind_group(
                "burnin_overlay_quad",
                &view,
                overlay.transform(),
                overlay.size(),
                render,
            );
            overlay_params.push(params);
            overlay_bind_groups.push(bg);
        }

        let target = self.create_target(
            "burnin_target",
            render,
            wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_SRC,
        );

        let grade = if scene.filter().is_identity() {
            None
        } else {
            Some(self.build_grade_pass(&scene, &target)?)
        };

        let bytes_per_row = align_to(
            render
                .width
                .checked_mul(4)
                .ok_or_else(|| ExportError::gpu_setup("render target width overflow"))?,
            wgpu::COPY_BYTES_PER_ROW_ALIGNMENT,
        );
        let readback_size = u64::from(bytes_per_row)
            .checked_mul(u64::from(render.height))
            .ok_or_else(|| ExportError::gpu_setup("readback buffer size overflow"))?;
        self.allocations += 1;
        let readback = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("burnin_readback"),
            size: readback_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Ok(GpuJob {
            scene,
            source,
            frame_bind_group,
            _frame_params: frame_params,
            overlay_bind_groups,
            _overlay_textures: overlay_textures,
            _overlay_params: overlay_params,
            target,
            grade,
            readback,
            readback_bytes_per_row: bytes_per_row,
        })
    }

    fn build_grade_pass(&mut self, scene: &CompositeScene, input: &Target) -> ExportResult<GradePass> {
        let filter = scene.filter();
        let lut = self.create_texture(
            "burnin_grade_lut",
            Size::new(256, 1),
            wgpu::TextureFormat::R8Unorm,
            wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
        );
        self.upload(&lut, Size::new(256, 1), 1, filter.lut());

        let mut rows = Vec::with_capacity(48);
        for row in filter.matrix() {
            for v in row {
                rows.extend_from_slice(&v.to_le_bytes());
            }
        }
        self.allocations += 2;
        let params = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("burnin_grade_params"),
                contents: &rows,
                usage: wgpu::BufferUsages::UNIFORM,
            });
        let target = self.create_target(
            "burnin_graded",
            scene.render_size(),
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("burnin_grade_bg"),
            layout: &self.grade.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::TextureView(&input.view),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: wgpu::BindingResource::TextureView(&lut.view),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: params.as_entire_binding(),
                },
            ],
        });
        Ok(GradePass {
            target,
            bind_group,
            _lut: lut,
            _params: params,
        })
    }

    fn encode_and_read(&self, job: &GpuJob, frame: &FrameRGBA) -> ExportResult<FrameRGBA> {
        self.upload(&job.source, job.scene.source_size(), 4, frame.data());

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("burnin_composite_encoder"),
            });
        {
            let mut rp = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("burnin_composite_rp"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &job.target.view,
                    resolve_target: None,
                    depth_slice: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            rp.set_pipeline(&self.quad.pipeline);
            rp.set_bind_group(0, &job.frame_bind_group, &[]);
            rp.draw(0..6, 0..1);
            for bg in &job.overlay_bind_groups {
                rp.set_bind_group(0, bg, &[]);
                rp.draw(0..6, 0..1);
            }
        }

        let result = match &job.grade {
            Some(grade) => {
                let mut rp = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("burnin_grade_rp"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &grade.target.view,
                        resolve_target: None,
                        depth_slice: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                rp.set_pipeline(&self.grade.pipeline);
                rp.set_bind_group(0, &grade.bind_group, &[]);
                rp.draw(0..3, 0..1);
                &grade.target
            }
            None => &job.target,
        };

        let render = job.scene.render_size();
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &result.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &job.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(job.readback_bytes_per_row),
                    rows_per_image: Some(render.height),
                },
            },
            extent(render),
        );
        self.queue.submit(Some(encoder.finish()));

        let buffer_slice = job.readback.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| ExportError::composite(format!("wgpu poll failed: {e:?}")))?;
        rx.recv()
            .map_err(|_| ExportError::composite("readback channel closed"))?
            .map_err(|e| ExportError::composite(format!("readback map failed: {e:?}")))?;

        let mut out = FrameRGBA::pooled(&self.pool, render);
        {
            let mapped = buffer_slice.get_mapped_range();
            let row_bytes = render.width as usize * 4;
            let padded = job.readback_bytes_per_row as usize;
            for (row, dst) in out.data_mut().chunks_exact_mut(row_bytes).enumerate() {
                let start = row * padded;
                dst.copy_from_slice(&mapped[start..start + row_bytes]);
            }
        }
        job.readback.unmap();
        Ok(out)
    }
}

impl Compositor for GpuCompositor {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn prepare(&mut self, scene: CompositeScene) -> ExportResult<()> {
        scene.validate()?;
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let job = self.build_job(scene);
        let oom = pollster::block_on(self.device.pop_error_scope());
        let invalid = pollster::block_on(self.device.pop_error_scope());
        if let Some(err) = oom.or(invalid) {
            return Err(ExportError::gpu_setup(format!(
                "texture cache setup failed: {err}"
            )));
        }
        self.job = Some(job?);
        Ok(())
    }

    fn composite_frame(&mut self, frame: &FrameRGBA) -> ExportResult<FrameRGBA> {
        let job = self
            .job
            .as_ref()
            .ok_or_else(|| ExportError::composite("compositor used before prepare"))?;
        if frame.size() != job.scene.source_size() {
            return Err(ExportError::composite(format!(
                "decoded frame is {}, expected {}",
                frame.size(),
                job.scene.source_size()
            )));
        }

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let out = self.encode_and_read(job, frame);
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(ExportError::composite(format!("gpu frame failed: {err}")));
        }
        let out = out?;
        self.frames += 1;
        Ok(out)
    }

    fn stats(&self) -> CompositorStats {
        CompositorStats {
            frames: self.frames,
            gpu_allocations: self.allocations,
        }
    }
}

fn build_quad_pipeline(device: &wgpu::Device) -> QuadPipeline {
    let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some("burnin_quad_sampler"),
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    });

    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("burnin_quad_bgl"),
        entries: &[
            wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    multisampled: false,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                },
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            },
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ],
    });

    let pipeline = build_pipeline(
        device,
        "burnin_quad",
        QUAD_SHADER,
        &layout,
        Some(wgpu::BlendState::ALPHA_BLENDING),
    );
    QuadPipeline {
        pipeline,
        layout,
        sampler,
    }
}

fn build_grade_pipeline(device: &wgpu::Device) -> GradePipeline {
    let texture_entry = |binding| wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Texture {
            multisampled: false,
            view_dimension: wgpu::TextureViewDimension::D2,
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
        },
        count: None,
    };
    let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
        label: Some("burnin_grade_bgl"),
        entries: &[
            texture_entry(0),
            texture_entry(1),
            wgpu::BindGroupLayoutEntry {
                binding: 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            },
        ],
    });
    let pipeline = build_pipeline(device, "burnin_grade", GRADE_SHADER, &layout, None);
    GradePipeline { pipeline, layout }
}

fn build_pipeline(
    device: &wgpu::Device,
    label: &str,
    source: &str,
    layout: &wgpu::BindGroupLayout,
    blend: Option<wgpu::BlendState>,
) -> wgpu::RenderPipeline {
    let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    });
    let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
        label: Some(label),
        bind_group_layouts: &[layout],
        push_constant_ranges: &[],
    });
    device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
        label: Some(label),
        layout: Some(&pipeline_layout),
        vertex: wgpu::VertexState {
            module: &shader,
            entry_point: Some("vs"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            buffers: &[],
        },
        fragment: Some(wgpu::FragmentState {
            module: &shader,
            entry_point: Some("fs"),
            compilation_options: wgpu::PipelineCompilationOptions::default(),
            targets: &[Some(wgpu::ColorTargetState {
                format: wgpu::TextureFormat::Rgba8Unorm,
                blend,
                write_mask: wgpu::ColorWrites::ALL,
            })],
        }),
        primitive: wgpu::PrimitiveState::default(),
        depth_stencil: None,
        multisample: wgpu::MultisampleState::default(),
        multiview: None,
        cache: None,
    })
}

/// `[a b c d] [e f W H] [tw th 0 0]` as little-endian f32s.
fn quad_params(transform: Affine, tex: Size, render: Size) -> Vec<u8> {
    let [a, b, c, d, e, f] = transform.as_coeffs();
    let values = [
        a as f32,
        b as f32,
        c as f32,
        d as f32,
        e as f32,
        f as f32,
        render.width as f32,
        render.height as f32,
        tex.width as f32,
        tex.height as f32,
        0.0,
        0.0,
    ];
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn extent(size: Size) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

fn align_to(value: u32, alignment: u32) -> u32 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{ColorTransform, FilterSpec};
    use crate::foundation::core::Vec2;
    use crate::geometry::{CorrectionSite, GeometryInput, RenderTarget, compute_transform};
    use crate::overlay::PreparedOverlay;
    use crate::render::surface_pool::SurfacePoolOpts;
    use image::RgbaImage;

    fn compositor() -> Option<GpuCompositor> {
        match GpuCompositor::new(SurfacePool::new(SurfacePoolOpts::default())) {
            Ok(c) => Some(c),
            Err(e) => {
                eprintln!("skipping: {e}");
                None
            }
        }
    }

    fn scene(size: Size, overlays: Vec<PreparedOverlay>, filter: ColorTransform) -> CompositeScene {
        let plan = compute_transform(GeometryInput {
            native_size: size,
            orientation_meta: None,
            mirrored: false,
            target: RenderTarget::default(),
            site: CorrectionSite::Compositor,
        })
        .unwrap();
        CompositeScene::new(&plan, overlays, filter)
    }

    #[test]
    fn align_to_rounds_up() {
        assert_eq!(align_to(1, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 256), 512);
    }

    #[test]
    fn quad_params_pack_twelve_floats() {
        let p = quad_params(Affine::translate((3.0, 4.0)), Size::new(2, 2), Size::new(8, 6));
        assert_eq!(p.len(), 48);
        assert_eq!(f32::from_le_bytes([p[16], p[17], p[18], p[19]]), 3.0);
        assert_eq!(f32::from_le_bytes([p[28], p[29], p[30], p[31]]), 6.0);
    }

    #[test]
    fn gpu_overlay_order_and_reuse() {
        let Some(mut c) = compositor() else {
            return;
        };
        let size = Size::new(16, 16);
        let red = Arc::new(RgbaImage::from_pixel(8, 8, image::Rgba([255, 0, 0, 255])));
        let green = Arc::new(RgbaImage::from_pixel(8, 8, image::Rgba([0, 255, 0, 255])));
        c.prepare(scene(
            size,
            vec![
                PreparedOverlay::from_render_space(red, Affine::translate(Vec2::new(2.0, 2.0))),
                PreparedOverlay::from_render_space(green, Affine::translate(Vec2::new(6.0, 6.0))),
            ],
            ColorTransform::identity(),
        ))
        .unwrap();
        let allocations = c.stats().gpu_allocations;
        let src = FrameRGBA::filled(size, [0, 0, 255, 255]);
        for _ in 0..5 {
            let out = c.composite_frame(&src).unwrap();
            assert_eq!(out.pixel(3, 3), Some([255, 0, 0, 255]));
            assert_eq!(out.pixel(8, 8), Some([0, 255, 0, 255]));
            assert_eq!(out.pixel(15, 0), Some([0, 0, 255, 255]));
        }
        assert_eq!(c.stats().gpu_allocations, allocations);
        assert_eq!(c.stats().frames, 5);
    }

    #[test]
    fn gpu_mono_filter_desaturates() {
        let Some(mut c) = compositor() else {
            return;
        };
        let size = Size::new(8, 8);
        c.prepare(scene(size, vec![], FilterSpec::Mono.color_transform()))
            .unwrap();
        let out = c
            .composite_frame(&FrameRGBA::filled(size, [200, 40, 90, 255]))
            .unwrap();
        let px = out.pixel(4, 4).unwrap();
        assert_eq!(px[0], px[1]);
        assert_eq!(px[1], px[2]);
    }
}
