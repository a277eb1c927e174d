//! Uploaded image records.
//!
//! Images are stored under a caller-chosen id and always belong to an
//! existing user; lookups go through the owner.

use std::sync::Arc;

use texflow_core::{DocumentStore, Error, Image, Result, User};

use crate::repository::Repository;

/// Repository for user images.
#[derive(Clone)]
pub struct ImageRecords {
    repo: Repository<Image>,
    users: Repository<User>,
}

impl ImageRecords {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            repo: Repository::new(store.clone()),
            users: Repository::new(store),
        }
    }

    /// Store an image; its owner must exist.
    pub async fn create(&self, image: &Image) -> Result<()> {
        if image.user_id.is_empty() {
            return Err(Error::InvalidInput("no user id provided".into()));
        }
        self.users.find(&image.user_id).await?;
        self.repo.create_with_id(image).await
    }

    /// Load an image owned by `user_id`.
    pub async fn get(&self, user_id: &str, image_id: &str) -> Result<Image> {
        if user_id.is_empty() {
            return Err(Error::InvalidInput("no user id provided".into()));
        }
        self.users.find(user_id).await?;
        let image = self.repo.find(image_id).await?;
        if image.user_id != user_id {
            return Err(Error::NotFound(format!(
                "no images document with id {} for user {}",
                image_id, user_id
            )));
        }
        Ok(image)
    }

    pub async fn delete(&self, image_id: &str) -> Result<()> {
        self.repo.delete(image_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Records;

    #[tokio::test]
    async fn test_create_requires_owner() {
        let records = Records::in_memory();
        let err = records
            .images
            .create(&Image::new("img1", "ghost", b"png"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_checks_owner() {
        let records = Records::in_memory();
        let alice = records.users.create().await.unwrap();
        let bob = records.users.create().await.unwrap();
        records
            .images
            .create(&Image::new("img1", &alice.user_id, b"png"))
            .await
            .unwrap();

        let image = records.images.get(&alice.user_id, "img1").await.unwrap();
        assert_eq!(image.image_id, "img1");
        assert_eq!(image.decode_content().unwrap(), b"png");

        let err = records.images.get(&bob.user_id, "img1").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let records = Records::in_memory();
        let user = records.users.create().await.unwrap();
        let image = Image::new("img1", &user.user_id, b"a");
        records.images.create(&image).await.unwrap();
        assert!(matches!(
            records.images.create(&image).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
