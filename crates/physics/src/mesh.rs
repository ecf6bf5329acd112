//! Borrowed views over raw triangle buffers
//!
//! A [`TriangleMesh`] reads positions and indices straight out of caller
//! buffers (e.g. a render vertex buffer with interleaved attributes). The
//! view borrows those buffers, so they cannot be freed or mutated while a
//! mesh view is alive. The geometry is copied when a static mesh shape is
//! built from the view.

use crate::error::{PhysicsError, Result};
use glam::Vec3;
use rapier3d::prelude::*;

const POSITION_SIZE: usize = 3 * std::mem::size_of::<f32>();

/// Width of one index in the index buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWidth {
    U8,
    U16,
    U32,
}

impl IndexWidth {
    /// Map an index stride in bytes to a width
    pub fn from_stride(stride: usize) -> Result<Self> {
        match stride {
            1 => Ok(IndexWidth::U8),
            2 => Ok(IndexWidth::U16),
            4 => Ok(IndexWidth::U32),
            _ => Err(PhysicsError::InvalidIndexStride { stride }),
        }
    }

    pub fn bytes(self) -> usize {
        match self {
            IndexWidth::U8 => 1,
            IndexWidth::U16 => 2,
            IndexWidth::U32 => 4,
        }
    }
}

/// Indexed triangle soup borrowed from raw vertex and index buffers
///
/// Each vertex occupies `vertex_stride` bytes and starts with three
/// native-endian `f32` position components. Every three consecutive indices
/// form one triangle.
#[derive(Debug, Clone, Copy)]
pub struct TriangleMesh<'a> {
    vertices: &'a [u8],
    vertex_stride: usize,
    vertex_count: usize,
    indices: &'a [u8],
    index_width: IndexWidth,
    index_count: usize,
}

impl<'a> TriangleMesh<'a> {
    /// Create a mesh view over raw buffers
    ///
    /// # Arguments
    /// * `vertices` - Vertex bytes, position in the first 12 bytes of each vertex
    /// * `vertex_stride` - Distance in bytes between consecutive vertices
    /// * `vertex_count` - Number of vertices
    /// * `indices` - Index bytes
    /// * `index_stride` - Size of one index: 1, 2 or 4 bytes
    /// * `index_count` - Number of indices (three per triangle)
    ///
    /// # Returns
    /// The view, or an error if the buffers cannot hold the described data
    /// or an index points past the last vertex
    pub fn new(
        vertices: &'a [u8],
        vertex_stride: usize,
        vertex_count: usize,
        indices: &'a [u8],
        index_stride: usize,
        index_count: usize,
    ) -> Result<Self> {
        let index_width = IndexWidth::from_stride(index_stride)?;
        if vertex_stride < POSITION_SIZE {
            return Err(PhysicsError::VertexStrideTooSmall {
                stride: vertex_stride,
            });
        }
        if index_count == 0 {
            return Err(PhysicsError::EmptyMesh);
        }
        if index_count % 3 != 0 {
            return Err(PhysicsError::IncompleteTriangle { count: index_count });
        }

        // The last vertex only needs room for its position, not a full stride
        let vertex_bytes = match vertex_count {
            0 => 0,
            n => (n - 1) * vertex_stride + POSITION_SIZE,
        };
        if vertices.len() < vertex_bytes {
            return Err(PhysicsError::BufferTooSmall {
                buffer: "vertex",
                expected: vertex_bytes,
                available: vertices.len(),
            });
        }
        let index_bytes = index_count * index_width.bytes();
        if indices.len() < index_bytes {
            return Err(PhysicsError::BufferTooSmall {
                buffer: "index",
                expected: index_bytes,
                available: indices.len(),
            });
        }

        let mesh = Self {
            vertices,
            vertex_stride,
            vertex_count,
            indices,
            index_width,
            index_count,
        };

        if let Some(index) = (0..index_count)
            .map(|i| mesh.index(i))
            .find(|&index| index as usize >= vertex_count)
        {
            return Err(PhysicsError::IndexOutOfBounds {
                index,
                vertex_count,
            });
        }

        Ok(mesh)
    }

    /// Create a mesh view over tightly packed positions and `u32` indices
    pub fn from_positions(positions: &'a [[f32; 3]], indices: &'a [u32]) -> Result<Self> {
        Self::new(
            bytemuck::cast_slice(positions),
            POSITION_SIZE,
            positions.len(),
            bytemuck::cast_slice(indices),
            4,
            indices.len(),
        )
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    pub fn triangle_count(&self) -> usize {
        self.index_count / 3
    }

    pub fn index_width(&self) -> IndexWidth {
        self.index_width
    }

    /// Position of vertex `i`
    pub fn vertex(&self, i: usize) -> Vec3 {
        let start = i * self.vertex_stride;
        let [x, y, z]: [f32; 3] =
            bytemuck::pod_read_unaligned(&self.vertices[start..start + POSITION_SIZE]);
        Vec3::new(x, y, z)
    }

    /// Index `i` of the index buffer, widened to `u32`
    pub fn index(&self, i: usize) -> u32 {
        let width = self.index_width.bytes();
        let bytes = &self.indices[i * width..(i + 1) * width];
        match self.index_width {
            IndexWidth::U8 => u32::from(bytes[0]),
            IndexWidth::U16 => u32::from(bytemuck::pod_read_unaligned::<u16>(bytes)),
            IndexWidth::U32 => bytemuck::pod_read_unaligned::<u32>(bytes),
        }
    }

    /// Iterate triangles as vertex index triples
    pub fn triangles(&self) -> impl Iterator<Item = [u32; 3]> + '_ {
        (0..self.triangle_count())
            .map(move |t| [self.index(3 * t), self.index(3 * t + 1), self.index(3 * t + 2)])
    }

    /// Copy the geometry into a rapier triangle mesh shape
    pub(crate) fn to_shared_shape(&self) -> Result<SharedShape> {
        let points: Vec<Point<Real>> = (0..self.vertex_count)
            .map(|i| {
                let v = self.vertex(i);
                point![v.x, v.y, v.z]
            })
            .collect();
        let triangles: Vec<[u32; 3]> = self.triangles().collect();

        SharedShape::trimesh(points, triangles).map_err(|e| PhysicsError::InvalidMeshData {
            reason: format!("{e:?}"),
        })
    }
}
