pub mod assistant;
pub mod context;
pub mod model;
pub mod mutation;
pub mod normalize;
pub mod page;
pub mod reconcile;
pub mod state;
pub mod stories;

pub use assistant::Assistant;
pub use context::{ActivePage, AppContext};
pub use model::{
    Bucket, Comment, LikeState, Likeable, Media, Message, Notification, NotificationKind, Post,
    Reel, Story, StoryKind, User, UserId,
};
pub use mutation::{MutationId, MutationLedger, MutationPhase, PendingEchoes, Rollback};
pub use page::{
    ChatPage, FeedPage, MediaUpload, NewStory, NotificationCenter, Page, Pending, ProfileEdit,
    ProfilePage, Settled, ShortsPage,
};
pub use state::{path, PageStatus, ViewError};
pub use stories::{StoryGroup, StoryViewer, ViewerSnapshot, ViewerStep};
