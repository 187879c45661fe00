use std::mem::size_of;

use ash::vk::{self, Handle};
use glam::{Mat4, Vec3, Vec4, Vec4Swizzles};
use log::trace;

use crate::raster::{MaterialInstance, MaterialPass};
use crate::vulkan::ray_tracing::GeometryDescriptor;
use crate::vulkan::{Buffer, Context};
use crate::HybridResult;

/// Interleaved so the uv components fill the padding after the vec3s.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vertex {
    pub position: Vec3,
    pub uv_x: f32,
    pub normal: Vec3,
    pub uv_y: f32,
    pub color: Vec4,
}

/// Vertex and index data of one mesh, uploaded to device local memory.
#[derive(Debug)]
pub struct MeshBuffers {
    pub vertex_buffer: Buffer,
    pub index_buffer: Buffer,
    pub vertex_buffer_address: vk::DeviceAddress,
    pub index_buffer_address: vk::DeviceAddress,
    pub vertex_count: u32,
    pub index_count: u32,
}

impl MeshBuffers {
    pub fn upload(context: &Context, vertices: &[Vertex], indices: &[u32]) -> HybridResult<Self> {
        trace!(
            "Uploading mesh with {} vertices and {} indices",
            vertices.len(),
            indices.len()
        );

        let vertex_buffer = context.create_gpu_only_buffer_from_data(
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::VERTEX_BUFFER,
            vertices,
        )?;
        let index_buffer = context.create_gpu_only_buffer_from_data(
            vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
                | vk::BufferUsageFlags::STORAGE_BUFFER,
            indices,
        )?;

        Ok(Self {
            vertex_buffer_address: vertex_buffer.get_device_address(),
            index_buffer_address: index_buffer.get_device_address(),
            vertex_buffer,
            index_buffer,
            vertex_count: vertices.len() as u32,
            index_count: indices.len() as u32,
        })
    }

    pub fn geometry(&self) -> GeometryDescriptor {
        geometry_of(
            self.vertex_buffer_address,
            self.index_buffer_address,
            self.vertex_count,
            self.index_count,
        )
    }
}

fn geometry_of(
    vertex_address: vk::DeviceAddress,
    index_address: vk::DeviceAddress,
    vertex_count: u32,
    index_count: u32,
) -> GeometryDescriptor {
    GeometryDescriptor {
        vertex_address,
        index_address,
        vertex_stride: size_of::<Vertex>() as vk::DeviceSize,
        max_vertex: vertex_count,
        primitive_count: index_count / 3,
        opaque: true,
    }
}

/// Axis aligned box around a mesh in its local space.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bounds {
    pub origin: Vec3,
    pub extents: Vec3,
    pub sphere_radius: f32,
}

impl Bounds {
    pub fn from_vertices(vertices: &[Vertex]) -> Self {
        let Some(first) = vertices.first() else {
            return Self::default();
        };

        let (min, max) = vertices
            .iter()
            .fold((first.position, first.position), |(min, max), v| {
                (min.min(v.position), max.max(v.position))
            });
        let extents = (max - min) / 2.0;

        Self {
            origin: (max + min) / 2.0,
            extents,
            sphere_radius: extents.length(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenderObject {
    pub index_count: u32,
    pub first_index: u32,
    pub index_buffer: vk::Buffer,
    pub material: MaterialInstance,
    pub bounds: Bounds,
    pub transform: Mat4,
    pub vertex_buffer_address: vk::DeviceAddress,
}

impl RenderObject {
    pub(crate) fn index_buffer_key(&self) -> u64 {
        self.index_buffer.as_raw()
    }
}

/// Surfaces collected for the current frame. Cleared once they were recorded.
#[derive(Debug, Default)]
pub struct DrawContext {
    pub opaque_surfaces: Vec<RenderObject>,
    pub transparent_surfaces: Vec<RenderObject>,
}

impl DrawContext {
    pub fn push(&mut self, object: RenderObject) {
        match object.material.pass {
            MaterialPass::Transparent => self.transparent_surfaces.push(object),
            MaterialPass::MainColor => self.opaque_surfaces.push(object),
        }
    }

    pub fn len(&self) -> usize {
        self.opaque_surfaces.len() + self.transparent_surfaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.opaque_surfaces.clear();
        self.transparent_surfaces.clear();
    }
}

const BOX_CORNERS: [Vec3; 8] = [
    Vec3::new(1.0, 1.0, 1.0),
    Vec3::new(1.0, 1.0, -1.0),
    Vec3::new(1.0, -1.0, 1.0),
    Vec3::new(1.0, -1.0, -1.0),
    Vec3::new(-1.0, 1.0, 1.0),
    Vec3::new(-1.0, 1.0, -1.0),
    Vec3::new(-1.0, -1.0, 1.0),
    Vec3::new(-1.0, -1.0, -1.0),
];

/// Conservative frustum test of the object's bounds against clip space.
pub fn is_visible(object: &RenderObject, view_proj: &Mat4) -> bool {
    let matrix = *view_proj * object.transform;

    let mut min = Vec3::splat(1.5);
    let mut max = Vec3::splat(-1.5);

    for corner in BOX_CORNERS {
        let local = object.bounds.origin + corner * object.bounds.extents;
        let clip = matrix * local.extend(1.0);
        let ndc = clip.xyz() / clip.w;

        min = min.min(ndc);
        max = max.max(ndc);
    }

    !(min.z > 1.0 || max.z < 0.0 || min.x > 1.0 || max.x < -1.0 || min.y > 1.0 || max.y < -1.0)
}

/// Indices of the visible opaque surfaces, grouped by material then index buffer.
pub fn sorted_opaque_draws(context: &DrawContext, view_proj: &Mat4) -> Vec<usize> {
    let mut draws = context
        .opaque_surfaces
        .iter()
        .enumerate()
        .filter(|(_, object)| is_visible(object, view_proj))
        .map(|(i, _)| i)
        .collect::<Vec<_>>();

    draws.sort_by_key(|&i| {
        let object = &context.opaque_surfaces[i];
        (object.material.id, object.index_buffer_key())
    });

    draws
}

/// Per frame uniform data shared by the raster and ray tracing paths.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuSceneData {
    pub view: Mat4,
    pub inv_view: Mat4,
    pub proj: Mat4,
    pub inv_proj: Mat4,
    pub view_proj: Mat4,
    pub ambient_color: Vec4,
    pub camera_position: Vec4,
    pub light_position: Vec4,
    pub light_color: Vec4,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneLighting {
    pub ambient_color: Vec4,
    pub light_position: Vec4,
    pub light_color: Vec4,
}

impl Default for SceneLighting {
    fn default() -> Self {
        Self {
            ambient_color: Vec4::splat(0.1),
            light_position: Vec4::new(0.0, 10.0, 0.0, 1.0),
            light_color: Vec4::ONE,
        }
    }
}

impl GpuSceneData {
    pub fn new(view: Mat4, proj: Mat4, lighting: &SceneLighting) -> Self {
        let inv_view = view.inverse();

        Self {
            view,
            inv_view,
            proj,
            inv_proj: proj.inverse(),
            view_proj: proj * view,
            ambient_color: lighting.ambient_color,
            camera_position: inv_view.w_axis,
            light_position: lighting.light_position,
            light_color: lighting.light_color,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::raster::{MaterialId, MaterialPipeline};

    pub(crate) fn material(id: u32, pipeline: u64, pass: MaterialPass) -> MaterialInstance {
        MaterialInstance {
            id: MaterialId(id),
            pipeline: MaterialPipeline {
                pipeline: vk::Pipeline::from_raw(pipeline),
                layout: vk::PipelineLayout::from_raw(pipeline),
            },
            set: vk::DescriptorSet::from_raw(100 + id as u64),
            pass,
        }
    }

    pub(crate) fn object(material: MaterialInstance, index_buffer: u64, position: Vec3) -> RenderObject {
        RenderObject {
            index_count: 36,
            first_index: 0,
            index_buffer: vk::Buffer::from_raw(index_buffer),
            material,
            bounds: Bounds {
                origin: Vec3::ZERO,
                extents: Vec3::splat(0.5),
                sphere_radius: 0.87,
            },
            transform: Mat4::from_translation(position),
            vertex_buffer_address: 0x1000,
        }
    }

    pub(crate) fn camera() -> Mat4 {
        let view = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(70f32.to_radians(), 16.0 / 9.0, 0.1, 100.0);
        proj * view
    }

    #[test]
    fn vertex_layout_matches_the_shaders() {
        assert_eq!(size_of::<Vertex>(), 48);
        assert_eq!(std::mem::offset_of!(Vertex, uv_x), 12);
        assert_eq!(std::mem::offset_of!(Vertex, normal), 16);
        assert_eq!(std::mem::offset_of!(Vertex, color), 32);
    }

    #[test]
    fn mesh_geometry_covers_every_triangle() {
        let geometry = geometry_of(0x10000, 0x20000, 24, 36);

        assert_eq!(geometry.vertex_stride, 48);
        assert_eq!(geometry.max_vertex, 24);
        assert_eq!(geometry.primitive_count, 12);
        assert!(geometry.opaque);
        assert_eq!(geometry.build_range().primitive_count, 12);
    }

    #[test]
    fn bounds_enclose_the_vertices() {
        let vertex = |x, y, z| Vertex {
            position: Vec3::new(x, y, z),
            ..Default::default()
        };
        let bounds = Bounds::from_vertices(&[vertex(-1.0, 0.0, 2.0), vertex(3.0, 2.0, 4.0)]);

        assert_eq!(bounds.origin, Vec3::new(1.0, 1.0, 3.0));
        assert_eq!(bounds.extents, Vec3::new(2.0, 1.0, 1.0));
        assert!((bounds.sphere_radius - 6f32.sqrt()).abs() < 1e-6);
        assert_eq!(Bounds::from_vertices(&[]), Bounds::default());
    }

    #[test]
    fn objects_in_front_of_the_camera_are_visible() {
        let material = material(0, 1, MaterialPass::MainColor);

        assert!(is_visible(&object(material, 1, Vec3::ZERO), &camera()));
        assert!(is_visible(&object(material, 1, Vec3::new(1.0, 1.0, -10.0)), &camera()));
    }

    #[test]
    fn objects_outside_the_frustum_are_culled() {
        let material = material(0, 1, MaterialPass::MainColor);

        assert!(!is_visible(&object(material, 1, Vec3::new(100.0, 0.0, 0.0)), &camera()));
        assert!(!is_visible(&object(material, 1, Vec3::new(0.0, -100.0, 0.0)), &camera()));
        assert!(!is_visible(&object(material, 1, Vec3::new(0.0, 0.0, -500.0)), &camera()));
    }

    #[test]
    fn opaque_draws_are_culled_and_grouped() {
        let mut context = DrawContext::default();
        let a = material(2, 1, MaterialPass::MainColor);
        let b = material(1, 1, MaterialPass::MainColor);

        context.push(object(a, 7, Vec3::ZERO));
        context.push(object(b, 9, Vec3::ZERO));
        context.push(object(a, 3, Vec3::ZERO));
        context.push(object(b, 9, Vec3::new(100.0, 0.0, 0.0)));
        context.push(object(b, 4, Vec3::ZERO));
        context.push(object(material(0, 1, MaterialPass::Transparent), 1, Vec3::ZERO));

        assert_eq!(context.opaque_surfaces.len(), 5);
        assert_eq!(context.transparent_surfaces.len(), 1);

        let draws = sorted_opaque_draws(&context, &camera());
        assert_eq!(draws, vec![4, 1, 2, 0]);

        context.clear();
        assert!(context.is_empty());
    }

    #[test]
    fn scene_data_derives_the_inverse_matrices() {
        let view = Mat4::look_at_rh(Vec3::new(2.0, 3.0, 5.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(1.2, 1.5, 0.1, 50.0);

        let data = GpuSceneData::new(view, proj, &SceneLighting::default());

        assert!((data.camera_position - Vec4::new(2.0, 3.0, 5.0, 1.0)).abs().max_element() < 1e-4);
        assert!(data.view_proj.abs_diff_eq(proj * view, 1e-6));
        assert!((data.inv_proj * data.proj).abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }
}
