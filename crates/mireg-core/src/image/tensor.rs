//! Conversion between host-side images and burn tensors.

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};

use super::{Header, Image};

impl Image {
    /// Upload the voxel buffer as a `[nz, ny, nx, nvols]` tensor.
    ///
    /// The host layout is already row-major in that order, so no reshuffling
    /// is needed.
    pub fn to_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 4> {
        let [nx, ny, nz] = self.header().dims();
        let data = TensorData::new(self.data().to_vec(), [nz, ny, nx, self.nvols()]);
        Tensor::<B, 4>::from_data(data, device)
    }

    /// Download a `[nz, ny, nx, nvols]` tensor onto the grid described by `header`.
    ///
    /// # Panics
    /// Panics if the tensor shape does not match the header.
    pub fn from_tensor<B: Backend>(header: Header, tensor: Tensor<B, 4>) -> Self {
        let [nx, ny, nz] = header.dims();
        assert_eq!(
            tensor.dims(),
            [nz, ny, nx, header.nvols()],
            "tensor shape must match header geometry"
        );
        let data = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .expect("converted tensor data is f32");
        Image::from_data(header, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_tensor_roundtrip_preserves_layout() {
        let device = Default::default();
        let header = Header::unit([3, 2, 1]).with_volumes(2);
        let data: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let img = Image::from_data(header.clone(), data.clone());

        let tensor = img.to_tensor::<B>(&device);
        assert_eq!(tensor.dims(), [1, 2, 3, 2]);

        let back = Image::from_tensor(header, tensor);
        assert_eq!(back.data(), data.as_slice());
    }
}
